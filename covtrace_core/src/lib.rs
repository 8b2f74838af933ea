pub mod campaign;
pub mod classify;
pub mod config;
pub mod corpus;
pub mod coverage;
pub mod executor;
pub mod trace;

pub use campaign::{CampaignError, CampaignOutcome, OutputDir, WORKING_INPUT_NAME};
pub use classify::{Classifier, ClassifyMode};
pub use config::{ConfigError, EngineConfig};
pub use corpus::{Corpus, CorpusError, MAX_INPUT_SIZE, TestCase};
pub use coverage::{
    CoverageChannelError, EXEC_FAIL_SIG, MAP_SIZE, SHM_ENV_VAR, SharedCoverageMap,
};
pub use executor::{ExecError, ExecOutcome, Executor, TargetCommand};
pub use trace::{MinimizePolicy, STDOUT_SINK, TraceError, TraceOptions};
