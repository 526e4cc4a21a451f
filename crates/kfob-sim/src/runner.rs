//! Simulated provisioning and pairing sessions.
//!
//! Every token interaction goes through encoded command frames via
//! [`exchange`], the same path a real ORWL host takes.

use anyhow::{bail, Context};
use serde::Serialize;
use tracing::{info, warn};

use kfob_core::cvm::{Pin, PIN_LEN};
use kfob_core::dispatch::DispatchStatsSnapshot;
use kfob_core::harness::{exchange, provision_pin, run_pairing_flow, HarnessError, OrwlHost};
use kfob_core::identity::{SERIAL_NUMBER_LEN, UNIQUE_ID_LEN};
use kfob_core::{
    AssociationStatus, Command, Dispatcher, FileStore, KeyFob, Request, StatusWord, Store,
    TokenPolicy,
};

use crate::config::SimConfig;

/// Identity and credential values written at provisioning time.
#[derive(Debug, Default)]
pub struct Provisioning {
    pub serial_number: Option<Vec<u8>>,
    pub unique_id: Option<Vec<u8>>,
    pub display_name: Option<String>,
    pub pin: Option<Pin>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub pairing_state: String,
    pub association_status: String,
    pub pin_configured: bool,
    pub pin_blocked: bool,
    pub pin_tries_remaining: u8,
    pub serial_number: Option<String>,
    pub unique_id: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairReport {
    pub pairing_state: String,
    pub requests: u64,
    pub rejected: u64,
}

impl From<(String, DispatchStatsSnapshot)> for PairReport {
    fn from((pairing_state, stats): (String, DispatchStatsSnapshot)) -> Self {
        Self {
            pairing_state,
            requests: stats.received,
            rejected: stats.rejected,
        }
    }
}

pub struct Simulator<S: Store> {
    dispatcher: Dispatcher<S>,
}

impl Simulator<FileStore> {
    /// Open the token file named by the configuration.
    pub fn open(config: &SimConfig) -> anyhow::Result<Self> {
        let store = FileStore::new(&config.state_path);
        Self::with_store(store, config.policy)
            .with_context(|| format!("opening token at {}", config.state_path.display()))
    }
}

impl<S: Store> Simulator<S> {
    pub fn with_store(store: S, policy: TokenPolicy) -> anyhow::Result<Self> {
        let fob = KeyFob::open(store, policy)?;
        Ok(Self {
            dispatcher: Dispatcher::new(fob),
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher<S> {
        &self.dispatcher
    }

    pub fn provision(&mut self, values: &Provisioning) -> anyhow::Result<()> {
        if let Some(serial) = &values.serial_number {
            check_len("serial number", serial, SERIAL_NUMBER_LEN)?;
            self.send(Request::new(Command::StoreSerialNumber, 0, serial.clone()))
                .context("storing serial number")?;
        }
        if let Some(id) = &values.unique_id {
            check_len("unique id", id, UNIQUE_ID_LEN)?;
            self.send(Request::new(Command::StoreUniqueId, 0, id.clone()))
                .context("storing unique id")?;
        }
        if let Some(name) = &values.display_name {
            let bytes = name.as_bytes().to_vec();
            let len = u8::try_from(bytes.len())
                .ok()
                .filter(|l| *l > 0)
                .with_context(|| format!("display name of {} bytes", bytes.len()))?;
            self.send(Request::new(Command::StoreDisplayName, len, bytes))
                .context("storing display name")?;
        }
        if let Some(pin) = &values.pin {
            provision_pin(&mut self.dispatcher, pin).context("configuring PIN")?;
        }
        info!("token provisioned");
        Ok(())
    }

    /// Pair with a freshly generated ORWL host.
    pub fn pair(&mut self, pin: Option<&Pin>) -> anyhow::Result<PairReport> {
        let mut host = OrwlHost::new()?;
        run_pairing_flow(&mut self.dispatcher, &mut host, pin).context("pairing flow")?;
        let state = self.dispatcher.fob().pairing_state().to_string();
        info!(state = %state, "token paired");
        Ok(PairReport::from((state, self.dispatcher.stats())))
    }

    pub fn status(&mut self) -> anyhow::Result<StatusReport> {
        let raw = self.send(Request::bare(Command::AssociationStatus))?;
        let association = match raw.first().copied().and_then(AssociationStatus::from_code) {
            Some(status) => status,
            None => bail!("unrecognised association status {:02x?}", raw),
        };

        let serial = self.read_optional(Command::GetSerialNumber)?;
        let unique_id = self.read_optional(Command::GetUniqueId)?;
        let name = self.read_optional(Command::GetDisplayName)?;

        let fob = self.dispatcher.fob();
        let cvm = &fob.state().cvm;
        Ok(StatusReport {
            pairing_state: fob.pairing_state().to_string(),
            association_status: format!("{:?}", association),
            pin_configured: cvm.is_configured(),
            pin_blocked: cvm.is_blocked(),
            pin_tries_remaining: cvm.tries_remaining(),
            serial_number: serial.map(hex::encode),
            unique_id: unique_id.map(hex::encode),
            display_name: name.map(|n| String::from_utf8_lossy(&n).into_owned()),
        })
    }

    pub fn reset(&mut self) -> anyhow::Result<()> {
        self.dispatcher.fob_mut().factory_reset()?;
        warn!("token wiped");
        Ok(())
    }

    fn send(&mut self, request: Request) -> Result<Vec<u8>, HarnessError> {
        exchange(&mut self.dispatcher, &request)
    }

    /// `NOT_SET` is an absent value, not a failure.
    fn read_optional(&mut self, command: Command) -> anyhow::Result<Option<Vec<u8>>> {
        match self.send(Request::bare(command)) {
            Ok(data) => Ok(Some(data)),
            Err(HarnessError::Refused { status, .. }) if status == StatusWord::NOT_SET => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn check_len(what: &str, bytes: &[u8], expected: usize) -> anyhow::Result<()> {
    if bytes.len() != expected {
        bail!("{} must be {} bytes, got {}", what, expected, bytes.len());
    }
    Ok(())
}

/// Parse a PIN given as six decimal digits.
pub fn parse_pin(text: &str) -> anyhow::Result<Pin> {
    if text.len() != PIN_LEN {
        bail!("PIN must be {} digits", PIN_LEN);
    }
    Ok(Pin::from_ascii(text)?)
}
