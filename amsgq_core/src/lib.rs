//! Active message queues over one-sided shared-memory windows.
//!
//! A peer joins a [`Group`], initialises the runtime with [`Amsgq::init`] and
//! opens queues collectively with [`Amsgq::open`]. Messages name a
//! [`Handler`] that runs on the receiving peer when it processes its inbox.

pub mod amsgq;
pub mod config;
pub mod constants;
pub mod errors;
pub mod fn_table;
pub mod helpers;
pub mod platform;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use amsgq::{AmsgQueue, Delivery, Handler};
pub use config::{AmsgqConfig, Backend, SopnopConfig};
pub use errors::{Error, ErrorCode};
pub use transport::{Channel, Group, ReplaceMode, Window};

use fn_table::FnOffsetTable;
use log::{debug, info};
use once_cell::sync::OnceCell;
use std::sync::{Arc, RwLock};

// ---- logging bootstraper -------------------------------------------------
pub(crate) fn ensure_logging() {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_init(|| {
        let _ = env_logger::builder()
            .format_timestamp(None)
            .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
            .try_init();
    });
}

/// State shared by a runtime and every queue opened from it.
pub(crate) struct Runtime {
    group: Group,
    config: AmsgqConfig,
    fn_table: RwLock<Option<FnOffsetTable>>,
}

impl Runtime {
    pub(crate) fn group(&self) -> &Group {
        &self.group
    }

    pub(crate) fn config(&self) -> &AmsgqConfig {
        &self.config
    }

    pub(crate) fn rank(&self) -> usize {
        self.group.rank()
    }

    pub(crate) fn encode(&self, handler: Handler, target: usize) -> Result<u64, Error> {
        let table = self
            .fn_table
            .read()
            .map_err(|_| Error::Other("handler table lock poisoned".into()))?;
        table
            .as_ref()
            .map(|t| t.encode(handler, target))
            .ok_or(Error::NotInitialised)
    }

    fn decode(&self, fn_handle: u64) -> Result<Handler, Error> {
        let table = self
            .fn_table
            .read()
            .map_err(|_| Error::Other("handler table lock poisoned".into()))?;
        table.as_ref().ok_or(Error::NotInitialised)?.decode(fn_handle)
    }

    /// Run the handler a record names.
    pub(crate) fn dispatch(&self, fn_handle: u64, sender: u32, payload: &[u8]) -> Result<(), Error> {
        let handler = self.decode(fn_handle)?;
        handler(&Delivery {
            rank: self.group.rank(),
            sender: sender as usize,
            payload,
        });
        Ok(())
    }

    pub(crate) fn is_live(&self) -> bool {
        self.fn_table.read().map(|t| t.is_some()).unwrap_or(false)
    }
}

/// Per-peer runtime: owns the handler translation table.
#[derive(Clone)]
pub struct Amsgq {
    runtime: Arc<Runtime>,
}

impl Amsgq {
    /// Collective over `group`; configuration comes from the environment.
    pub fn init(group: &Group) -> Result<Self, Error> {
        Self::init_with_config(group, AmsgqConfig::from_env())
    }

    pub fn init_with_config(group: &Group, config: AmsgqConfig) -> Result<Self, Error> {
        Self::init_with_image_slide(group, config, 0)
    }

    /// Like [`init_with_config`](Self::init_with_config), but pretends this
    /// peer's image was loaded `slide` bytes away from where it really is.
    #[doc(hidden)]
    pub fn init_with_image_slide(group: &Group, config: AmsgqConfig, slide: u64) -> Result<Self, Error> {
        ensure_logging();
        telemetry::init();
        let table = FnOffsetTable::establish(group, slide)?;
        info!(
            "rank {}/{}: active messages ready ({} back-end)",
            group.rank(),
            group.size(),
            config.backend
        );
        Ok(Self {
            runtime: Arc::new(Runtime {
                group: group.clone(),
                config,
                fn_table: RwLock::new(Some(table)),
            }),
        })
    }

    /// Collective: open a queue with the configured back-end.
    pub fn open(&self, msg_size_max: usize, msg_count: usize, group: &Group) -> Result<AmsgQueue, Error> {
        self.open_with_backend(self.runtime.config.backend, msg_size_max, msg_count, group)
    }

    /// Collective: open a queue with an explicit back-end.
    pub fn open_with_backend(
        &self,
        backend: Backend,
        msg_size_max: usize,
        msg_count: usize,
        group: &Group,
    ) -> Result<AmsgQueue, Error> {
        if !self.runtime.is_live() {
            return Err(Error::NotInitialised);
        }
        if !group.same_as(&self.runtime.group) {
            return Err(Error::Invalid(format!(
                "queue group {:?} differs from the runtime's {:?}",
                group.name(),
                self.runtime.group.name()
            )));
        }
        AmsgQueue::open(self.runtime.clone(), backend, msg_size_max, msg_count)
    }

    /// Drop the handler table; queues still open report `NotInitialised`.
    pub fn finalize(&self) {
        if let Ok(mut table) = self.runtime.fn_table.write() {
            if table.take().is_some() {
                debug!("rank {}: handler table released", self.runtime.rank());
            }
        }
    }

    pub fn is_initialised(&self) -> bool {
        self.runtime.is_live()
    }

    /// Whether handler addresses are rebased on their way to other peers.
    pub fn translates_handlers(&self) -> bool {
        self.runtime
            .fn_table
            .read()
            .map(|t| t.as_ref().map(|t| !t.is_identity()).unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn group(&self) -> &Group {
        &self.runtime.group
    }

    pub fn config(&self) -> &AmsgqConfig {
        &self.runtime.config
    }
}
