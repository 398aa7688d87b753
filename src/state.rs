//! Crash-safe persistence of trade state within one trading day.
//!
//! The whole plan is small, so the file is rewritten after every state
//! transition: serialize, write to a sibling temp file, rename over the
//! original. On startup, a same-day file is merged back into the plan; a
//! stale one is discarded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::EngineError;
use crate::trade::Trade;

/// On-disk shape of the recovery file.
#[derive(Serialize, Deserialize, Debug)]
pub struct StateFile {
    /// Trading day the records belong to.
    pub date: NaiveDate,
    /// Records keyed by trade id.
    pub trades: BTreeMap<u32, Trade>,
}

/// The store. Writes are serialized internally; there is no external reader.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl StateStore {
    /// A store over the given file path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// The file the store writes to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the current plan state for the given day.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::State`] if serialization or any file
    /// operation fails.
    pub async fn save(&self, date: NaiveDate, trades: &[Trade]) -> Result<(), EngineError> {
        let _guard = self.write_lock.lock().await;

        let file = StateFile {
            date,
            trades: trades.iter().map(|trade| (trade.id, trade.clone())).collect(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|err| EngineError::State(err.to_string()))?;

        let temp = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp, json.as_bytes())
            .await
            .map_err(|err| EngineError::State(err.to_string()))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|err| EngineError::State(err.to_string()))?;

        log::debug!("state saved to {}", self.path.display());

        Ok(())
    }

    /// Load the records for `today`. A missing file or one from another day
    /// yields `None`; the stale file is removed.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::State`] if the file exists but cannot be
    /// parsed.
    pub async fn load(
        &self,
        today: NaiveDate,
    ) -> Result<Option<BTreeMap<u32, Trade>>, EngineError> {
        let json = match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(EngineError::State(err.to_string())),
        };

        let file: StateFile =
            serde_json::from_str(&json).map_err(|err| EngineError::State(err.to_string()))?;

        if file.date != today {
            log::info!(
                "state file is from {}, discarding for {today}",
                file.date
            );
            self.clear().await;
            return Ok(None);
        }

        Ok(Some(file.trades))
    }

    /// Delete the file, after a clean completion or a stale-date load.
    pub async fn clear(&self) {
        let _guard = self.write_lock.lock().await;

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => log::debug!("state file removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => log::warn!("state file removal failed: {err}"),
        }
    }
}

/// Merge recovered records into the plan by id, carrying every runtime field
/// forward while keeping the plan's own scheduling definition authoritative.
pub fn merge_records(plan: &mut [Trade], records: &BTreeMap<u32, Trade>) {
    for trade in plan.iter_mut() {
        let Some(record) = records.get(&trade.id) else {
            continue;
        };

        trade.status = record.status;
        trade.uic = record.uic.or(trade.uic);
        trade.decimals = record.decimals;
        trade.entry_order_id = record.entry_order_id.clone();
        trade.exit_order_id = record.exit_order_id.clone();
        trade.position_id = record.position_id.clone();
        trade.entry_fill_price = record.entry_fill_price;
        trade.exit_fill_price = record.exit_fill_price;
        trade.entry_filled_amount = record.entry_filled_amount;
        trade.entry_timestamp_actual = record.entry_timestamp_actual;
        trade.exit_timestamp_actual = record.exit_timestamp_actual;
        trade.pips_profit = record.pips_profit;

        log::info!("trade {} recovered at `{}`", trade.id, trade.status);
    }
}
