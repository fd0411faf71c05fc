pub mod caption;
pub mod client;
pub mod commit;
pub mod config;
pub mod credentials;
pub mod discovery;
pub mod iptc;
pub mod lock;
pub mod orchestrator;
pub mod parser;

pub use caption::CaptionExtractor;
pub use client::{ClientError, DescriptionClient, DescriptionRequest, OpenAiVisionClient};
pub use commit::{EmbedCommitter, LedgerCommitter, MetadataCommitter};
pub use config::EngineConfig;
pub use credentials::{ApiKeySource, CredentialRecord, CredentialStore};
pub use discovery::discover_images;
pub use lock::{default_probe, HolderProbe, LockReleaser, ProcessHandle};
pub use orchestrator::{BatchOrchestrator, BatchState};
pub use parser::ResponseParser;
