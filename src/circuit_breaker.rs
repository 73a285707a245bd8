use failsafe::{backoff, failure_policy, Config};
use std::time::Duration;

/// Creates the circuit breaker guarding scheduled metric recalculations.
///
/// # Configuration
///
/// - **Failure threshold**: 5 consecutive failed runs trigger OPEN state.
/// - **Backoff**: Exponential backoff from 10s to 60s before attempting recovery.
///
/// # States
///
/// - **CLOSED**: Scheduled runs execute normally.
/// - **OPEN**: The database keeps failing; ticks are skipped instead of
///   piling more load on it.
/// - **HALF_OPEN**: The next tick probes whether the database recovered.
///
/// # Returns
///
/// * `impl failsafe::CircuitBreaker` - The configured circuit breaker instance.
pub fn create_recalculation_circuit_breaker() -> impl failsafe::CircuitBreaker {
    let backoff_strategy = backoff::exponential(
        Duration::from_secs(10), // Initial delay
        Duration::from_secs(60), // Maximum delay
    );

    let failure_policy = failure_policy::consecutive_failures(5, backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use failsafe::{CircuitBreaker, Error};

    #[test]
    fn test_circuit_breaker_opens_after_failed_runs() {
        let cb = create_recalculation_circuit_breaker();

        for _ in 0..5 {
            let result: Result<(), Error<&str>> = cb.call(|| Err::<(), &str>("connection refused"));
            assert!(result.is_err());
        }

        assert!(!cb.is_call_permitted());

        let result: Result<(), Error<&str>> = cb.call(|| Ok::<(), &str>(()));
        match result {
            Err(Error::Rejected) => {}
            _ => panic!("Expected circuit to be open and reject runs"),
        }
    }

    #[test]
    fn test_recorded_outcome_is_passed_through() {
        let cb = create_recalculation_circuit_breaker();

        let outcome: Result<usize, &str> = Ok(12);
        let result: Result<usize, Error<&str>> = cb.call(move || outcome);

        assert_eq!(result.unwrap(), 12);
        assert!(cb.is_call_permitted());
    }
}
