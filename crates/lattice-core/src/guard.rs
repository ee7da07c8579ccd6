use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardedCall<T> {
    pub result: Result<T, String>,
    pub elapsed_ms: u128,
}

/// Runs plugin-authored code so that neither an `Err` nor a panic escapes
/// into the host.
pub fn guarded<T>(call: impl FnOnce() -> Result<T, String>) -> Result<T, String> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

pub fn guarded_timed<T>(call: impl FnOnce() -> Result<T, String>) -> GuardedCall<T> {
    let started_at = Instant::now();
    let result = guarded(call);
    GuardedCall {
        result,
        elapsed_ms: started_at.elapsed().as_millis(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "plugin panicked".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_results_through() {
        assert_eq!(guarded(|| Ok::<_, String>(7)), Ok(7));
        assert_eq!(
            guarded(|| Err::<(), _>("nope".to_string())),
            Err("nope".to_string())
        );
    }

    #[test]
    fn converts_panics_to_errors() {
        let result: Result<(), String> = guarded(|| panic!("exploded"));
        assert_eq!(result, Err("exploded".to_string()));

        let code = 3;
        let result: Result<(), String> = guarded(|| panic!("exit {code}"));
        assert_eq!(result, Err("exit 3".to_string()));
    }

    #[test]
    fn timed_call_reports_elapsed() {
        let call = guarded_timed(|| {
            std::thread::sleep(std::time::Duration::from_millis(5));
            Ok::<_, String>(())
        });
        assert!(call.result.is_ok());
        assert!(call.elapsed_ms >= 5);
    }
}
