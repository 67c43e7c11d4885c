pub mod assignment_cache;
pub mod realtime;
pub mod results_cache;

pub use assignment_cache::AssignmentCache;
pub use realtime::RealtimeCounters;
pub use results_cache::ResultsCache;
