use otf_learner::learner::policy::{evaluate, histogram, normalize};

#[test]
fn test_scores_use_absolute_variance() {
    let scores = normalize(&[4.0, -4.0, 0.0], 2.0);
    assert_eq!(scores, vec![1.0, 1.0, 0.0]);
}

#[test]
fn test_nan_variance_always_queries() {
    let decision = evaluate(&[1e-12, f64::NAN, 0.0], 1.0, 0.005, 0.0025);
    assert!(decision.scores[1].is_infinite());
    assert!(decision.should_query);
    assert_eq!(decision.atoms_to_add, vec![1]);
}

#[test]
fn test_call_threshold_is_strict() {
    let sigma = 1.0;
    let call = 0.005;
    let eps = 1e-9;

    let at = |score: f64| vec![score * score, 0.0, 0.0];

    assert!(evaluate(&at(call + eps), sigma, call, 0.0025).should_query);
    assert!(!evaluate(&at(call - eps), sigma, call, 0.0025).should_query);
    // Exactly on the threshold is not above it.
    assert!(!evaluate(&[0.25], 0.5, 1.0, 0.5).should_query);
}

#[test]
fn test_add_subset_containment() {
    let variances: Vec<f64> = (0..50).map(|i| (i as f64 * 1e-4).powi(2)).collect();
    let decision = evaluate(&variances, 1.0, 0.004, 0.002);

    assert!(decision.should_query);
    for &a in &decision.atoms_to_add {
        assert!(a < variances.len());
        assert!(decision.scores[a] > 0.002);
    }
    // Every atom above the add threshold is selected, in ascending order.
    let expected: Vec<usize> = (0..50).filter(|&i| decision.scores[i] > 0.002).collect();
    assert_eq!(decision.atoms_to_add, expected);
}

#[test]
fn test_query_without_additions_when_add_threshold_high() {
    let decision = evaluate(&[0.01f64.powi(2), 0.0], 1.0, 0.005, 0.005);
    assert!(decision.should_query);
    assert_eq!(decision.atoms_to_add, vec![0]);

    let quiet = evaluate(&[0.001f64.powi(2)], 1.0, 0.005, 0.0025);
    assert!(!quiet.should_query);
    assert!(quiet.atoms_to_add.is_empty());
    assert!((quiet.max_score - 0.001).abs() < 1e-15);
}

#[test]
fn test_empty_configuration() {
    let decision = evaluate(&[], 1.0, 0.005, 0.0025);
    assert!(!decision.should_query);
    assert_eq!(decision.max_score, 0.0);
    assert!(decision.atoms_to_add.is_empty());
}

#[test]
fn test_histogram_bins() {
    let counts = histogram(&[0.0, 0.1, 0.49, 0.5, 0.99, 5.0, f64::INFINITY], 2, 1.0);
    assert_eq!(counts, vec![3, 4]);
    assert_eq!(histogram(&[0.3], 0, 1.0), Vec::<usize>::new());
    assert_eq!(histogram(&[0.3], 3, 0.0), vec![0, 0, 0]);
}
