//! Causal analysis of a per-unit transaction tax on subscription spending.
//!
//! Card-transaction extracts are loaded and filtered (`load`), optionally
//! restricted to a constant panel of individuals (`panelize`), and aggregated
//! to ZIP3-by-period outcomes (`aggregate`). The treated ZIP3 is compared with
//! size-matched donors (`donors`) by two-way fixed-effects DiD and an event
//! study (`did`), and by a synthetic control (`synth`) with placebo inference
//! (`placebo`) and leave-k-out sensitivity (`robustness`).

pub mod aggregate;
pub mod calendar;
pub mod config;
pub mod covariates;
pub mod describe;
pub mod did;
pub mod donors;
pub mod error;
pub mod io;
pub mod load;
pub mod modal_zip3;
pub mod ols;
pub mod panelize;
pub mod pipeline;
pub mod placebo;
pub mod report;
pub mod robustness;
pub mod simulate;
pub mod synth;
pub mod types;

#[cfg(feature = "instrument")]
pub use instrument;

pub use calendar::YearMonth;
pub use config::{AmountFilter, AnalysisConfig, Outcome, PlaceboPool, Zip3Source};
pub use error::{AnalysisError, Result};
pub use types::{AddressSpan, CardRecord, Transaction, Zip3};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Event targets that carry table rows rather than log lines.
pub const RECORDED_TABLES: [&str; 5] = ["panel_window", "event_study", "donor_weight", "placebo", "leave_k_out"];
