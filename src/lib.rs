//! Sideline: shared game-day context replication and period notifications.
//!
//! A set of independent surfaces (score table, stat entry, roster board)
//! all operate on one small "current focus" record: which game/drive/play
//! or tryout/station/rep is being worked on right now. This crate keeps
//! every context eventually consistent on that record and announces
//! period transitions exactly once per context.
//!
//! # Architecture
//!
//! - **Context store**: a last-writer-wins record in a durable slot file,
//!   mutated only through provenance-tagged merges, with bidirectional
//!   aliasing between the game and tryout naming schemes
//! - **Local bus**: near-zero-latency fan-out of merged records and
//!   fired notices to the other contexts in the process
//! - **Remote sync**: optional poll/push replication against a remote
//!   authority, watermark-gated so stale reads never win
//! - **Period scheduler**: timezone-aware warning and start timers for
//!   the day's periods, rearmed at midnight
//! - **Notice dispatcher**: one reusable surface per context with a
//!   one-second de-duplication window on the relay path

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod notify;
pub mod periods;
pub mod runtime;

pub use clock::{Clock, SystemClock, ZonedClock};
pub use config::SidelineConfig;
pub use context::{ContextRecord, ContextStore, LocalBus, Provenance, RemoteSync};
pub use error::{Result, SidelineError};
pub use notify::{NoticeDispatcher, NoticeSurface};
pub use periods::{Period, PeriodScheduler, PeriodSource};
pub use runtime::Runtime;
