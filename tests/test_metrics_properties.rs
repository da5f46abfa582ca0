//! Property tests for the connectivity metric transitions

use amqp_supervisor::observability::ConnectivityMetrics;
use proptest::prelude::*;

proptest! {
    #[test]
    fn test_metrics_follow_signal_sequence(signals in prop::collection::vec(any::<bool>(), 0..64)) {
        let metrics = ConnectivityMetrics::new();
        let mut previous = metrics.snapshot();

        for connected in signals {
            let was_connected = previous.is_connected == 1;
            metrics.set_connected(connected);
            let current = metrics.snapshot();

            // Gauge mirrors the latest signal
            prop_assert_eq!(current.is_connected, u8::from(connected));

            // Total never decreases and grows only while disconnected
            if was_connected {
                prop_assert_eq!(current.reconnection_attempts, previous.reconnection_attempts);
            } else {
                prop_assert_eq!(current.reconnection_attempts, previous.reconnection_attempts + 1);
            }

            // Batch is at most the total
            prop_assert!(current.reconnection_attempts_latest_batch <= current.reconnection_attempts);

            if was_connected && !connected {
                prop_assert_eq!(current.reconnection_attempts_latest_batch, 0);
            }
            if was_connected && connected {
                prop_assert_eq!(current, previous);
            }

            previous = current;
        }
    }

    #[test]
    fn test_batch_counts_attempts_since_last_loss(failures in 0u64..50) {
        let metrics = ConnectivityMetrics::new();
        metrics.set_connected(true);
        metrics.set_connected(false);

        for _ in 0..failures {
            metrics.set_connected(false);
        }
        metrics.set_connected(true);

        let snapshot = metrics.snapshot();
        prop_assert_eq!(snapshot.reconnection_attempts_latest_batch, failures + 1);
        prop_assert_eq!(snapshot.reconnection_attempts, failures + 2);
    }
}
