//! Averaging window behaviour over virtual time.
use aqua_core::AveragingWindow;
use aqua_traits::TestClock;
use proptest::prelude::*;
use rstest::rstest;
use std::sync::Arc;

fn approx(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => (x - y).abs() < 1e-9,
        (None, None) => true,
        _ => false,
    }
}

/// One-second window at 50 % fill: the minimum sample count is `hz / 2`, so
/// the higher the expected rate, the later a finite mean shows up.
#[rstest]
#[case(2.0, Some(5.0), Some(11.0), Some(17.0))]
#[case(4.0, Some(5.0), Some(11.0), Some(17.0))]
#[case(6.0, None, Some(11.0), None)]
#[case(8.0, None, Some(11.0), None)]
#[case(10.0, None, None, None)]
fn sample_sequence_for_rate(
    #[case] hz: f64,
    #[case] after_first_pair: Option<f64>,
    #[case] after_four: Option<f64>,
    #[case] after_expiry: Option<f64>,
) {
    let clock = TestClock::new();
    let mut w = AveragingWindow::new(1.0, hz, 50.0, Arc::new(clock.clone()));

    w.add(0.0);
    w.add(10.0);
    assert!(approx(w.get(), after_first_pair), "hz={hz} t=0");
    assert_eq!(w.count(), 2);

    clock.set_secs(0.5);
    w.add(20.0);
    clock.set_secs(0.9);
    w.add(14.0);
    assert!(approx(w.get(), after_four), "hz={hz} t=0.9");
    assert_eq!(w.count(), 4);

    clock.set_secs(1.3);
    assert!(approx(w.get(), after_expiry), "hz={hz} t=1.3");
    assert_eq!(w.count(), 2);

    clock.set_secs(2.2);
    assert_eq!(w.get(), None);
    assert_eq!(w.count(), 0);
}

#[test]
fn threshold_is_span_times_rate_times_percent() {
    let w = AveragingWindow::new(600.0, 7.0, 80.0, Arc::new(TestClock::new()));
    assert!((w.min_samples() - 3360.0).abs() < 1e-9);
}

proptest! {
    /// After a refresh, the reported mean is the exact mean of the samples
    /// younger than the span, and the count matches them.
    #[test]
    fn mean_matches_retained_samples(
        steps in proptest::collection::vec((0u64..700, -100.0f64..100.0), 1..60)
    ) {
        let clock = TestClock::new();
        let mut w = AveragingWindow::new(2.0, 1.0, 1.0, Arc::new(clock.clone()));
        let mut t_ms = 0u64;
        let mut log: Vec<(u64, f64)> = Vec::new();
        for (dt, v) in steps {
            t_ms += dt;
            clock.set_offset(std::time::Duration::from_millis(t_ms));
            w.add(v);
            log.push((t_ms, v));

            let live: Vec<f64> = log
                .iter()
                .filter(|(at, _)| t_ms - at < 2000)
                .map(|(_, v)| *v)
                .collect();
            prop_assert_eq!(w.count(), live.len());
            let expected = live.iter().sum::<f64>() / live.len() as f64;
            let got = w.get().unwrap();
            prop_assert!((got - expected).abs() < 1e-9);
        }
    }
}
