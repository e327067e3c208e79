//! Time-ordered identifiers for edit batches and analysis runs.
//!
//! Entities use UUID v4 keys. Anything that groups rows written together
//! (an edit batch, one analysis pass) gets a ULID instead, so ids sort by
//! creation time when listed.

use once_cell::sync::Lazy;
use ulid::Ulid;

static PROCESS_RUN_ID: Lazy<String> = Lazy::new(|| Ulid::new().to_string());

/// Id shared by everything this process writes, handy for log correlation.
#[inline]
pub fn process() -> &'static str {
    &PROCESS_RUN_ID
}

/// Fresh id for a ledger batch.
#[inline]
pub fn batch_id() -> String {
    Ulid::new().to_string()
}

/// Fresh id for one analysis run of a project.
#[inline]
pub fn analysis_run_id() -> String {
    Ulid::new().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_id_is_stable() {
        assert_eq!(process(), process());
        assert_eq!(process().len(), 26);
    }

    #[test]
    fn batch_ids_are_unique_and_time_ordered() {
        let older = batch_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let newer = batch_id();
        assert_ne!(older, newer);
        assert!(older < newer);
    }
}
