/// Mirrors the dispatcher's job-state transition table. Retained here only
/// for test parity with the dispatcher's contract (§8, testable property 5);
/// this worker does not itself drive job-state transitions.
pub fn is_valid_job_state_transition(current: &str, new: &str) -> bool {
    match current {
        "pending" => matches!(new, "assigned" | "failed" | "cancelled"),
        "assigned" => matches!(new, "completed" | "failed" | "failed_retry"),
        "failed_retry" => matches!(new, "pending" | "failed_permanently"),
        "failed" => matches!(new, "pending" | "failed_permanently"),
        _ => false,
    }
}
