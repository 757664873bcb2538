use refcap_transformers::cider::Cider;

fn references() -> Vec<Vec<&'static str>> {
    vec![
        vec!["the red car parked on the left", "red car on the left side"],
        vec!["a woman holding a blue umbrella", "woman with the blue umbrella"],
    ]
}

#[test]
fn exact_match_scores_higher_than_unrelated() {
    let cider = Cider::default();
    let good = cider.compute(
        &["the red car parked on the left", "woman with the blue umbrella"],
        &references(),
    );
    let bad = cider.compute(&["a blue umbrella", "red car"], &references());
    assert_eq!(good.per_sample.len(), 2);
    assert!(good.corpus > bad.corpus);
    assert!(good.per_sample.iter().all(|&s| s > 0.));
    assert!(bad.per_sample.iter().all(|&s| s < 1e-9));
}

#[test]
fn identical_single_reference_scores_ten() {
    let cider = Cider::default();
    let refs = vec![
        vec!["small brown dog sitting down"],
        vec!["tall man wearing green jacket"],
    ];
    let score = cider.compute(
        &["small brown dog sitting down", "tall man wearing green jacket"],
        &refs,
    );
    for s in score.per_sample {
        assert!((s - 10.).abs() < 1e-9, "{s}");
    }
}

#[test]
fn length_penalty_lowers_the_score() {
    let cider = Cider::default();
    let refs = vec![
        vec!["small brown dog sitting down"],
        vec!["tall man wearing green jacket"],
    ];
    let exact = cider.compute(&["small brown dog sitting down", "x"], &refs);
    let padded = cider.compute(
        &[
            "small brown dog sitting down on the floor next to a big old couch near the door",
            "x",
        ],
        &refs,
    );
    assert!(padded.per_sample[0] < exact.per_sample[0]);
    assert!(padded.per_sample[0] > 0.);
}

#[test]
fn empty_inputs() {
    let cider = Cider::new(4, 6.);
    let score = cider.compute::<&str, &str>(&[], &[]);
    assert!(score.per_sample.is_empty());
    assert_eq!(score.corpus, 0.);
    let score = cider.compute(&["a caption"], &[Vec::<&str>::new()]);
    assert_eq!(score.per_sample, [0.]);
}
