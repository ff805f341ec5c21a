pub mod schedule;
pub mod time;

pub use schedule::{is_scheduled_time_due, parse_scheduled_time, SCHEDULED_TIME_FORMAT};
pub use time::{get_epoch_time_in_ms, get_epoch_time_in_secs};

pub trait OptionInspectNone<T> {
    fn inspect_none(self, inspector_function: impl FnOnce()) -> Self;
}

impl<T> OptionInspectNone<T> for Option<T> {
    fn inspect_none(self, inspector_function: impl FnOnce()) -> Self {
        if self.is_none() {
            inspector_function();
        }
        self
    }
}

impl<T> OptionInspectNone<T> for &Option<T> {
    fn inspect_none(self, inspector_function: impl FnOnce()) -> Self {
        if self.is_none() {
            inspector_function();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inspect_none_only_runs_on_none() {
        let mut calls = 0;
        let _ = Some(1).inspect_none(|| calls += 1);
        assert_eq!(calls, 0);

        let _ = None::<u32>.inspect_none(|| calls += 1);
        assert_eq!(calls, 1);
    }
}
