pub mod clock;
pub mod hours;
pub mod report;

pub use clock::{Clock, ManualClock, SystemClock};
pub use hours::{contiguous_windows, floor_to_hour, required_hours};
pub use report::{HttpReportExecutor, ReportError, ReportExecutor, ReportOutcome, ReportRequest};
