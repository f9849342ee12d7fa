pub mod accuracy;
pub mod config;
pub mod metrics;
pub mod report;
pub mod rng;
pub mod scalars;
pub mod schedule;
pub mod visualization;

pub use accuracy::accuracy;
pub use config::{load_json, save_json};
pub use metrics::{AverageMeter, EpochMetrics, EvaluationMetrics};
pub use report::{ensure_report_file, update_sections, ReportSection, RUN_NOTEBOOK_TEMPLATE};
pub use rng::{derive_seed, rng_from, seeded_rng};
pub use scalars::{read_scalars, ScalarLog, ScalarPoint};
pub use schedule::StepSchedule;
pub use visualization::encode_chw_png_data_url;
