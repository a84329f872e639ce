#![forbid(unsafe_code)]

//! Persisted list of channels the archiver follows.
//!
//! A channel starts in `subscribing` until its first full backfill succeeds,
//! then moves to `subscribed` for incremental polling. The document on disk is
//! rewritten after every transition so a crash never loses completed work.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::IngestError;

/// Serialized form of the subscription document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionState {
    #[serde(default)]
    pub subscribing: Vec<String>,
    #[serde(default)]
    pub subscribed: Vec<String>,
    #[serde(default)]
    pub titles: BTreeMap<String, String>,
}

impl SubscriptionState {
    /// Rejects documents where a channel is listed twice or in both lists.
    fn validate(&self) -> Result<(), IngestError> {
        let mut pending = HashSet::new();
        for id in &self.subscribing {
            if !pending.insert(id.as_str()) {
                return Err(IngestError::Consistency(format!(
                    "{id} is listed twice in subscribing"
                )));
            }
        }
        let mut onboarded = HashSet::new();
        for id in &self.subscribed {
            if !onboarded.insert(id.as_str()) {
                return Err(IngestError::Consistency(format!(
                    "{id} is listed twice in subscribed"
                )));
            }
            if pending.contains(id.as_str()) {
                return Err(IngestError::Consistency(format!(
                    "{id} is both subscribing and subscribed"
                )));
            }
        }
        Ok(())
    }
}

/// Result of [`SubscriptionStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Added,
    AlreadyPending,
    AlreadySubscribed,
}

#[derive(Debug)]
pub struct SubscriptionStore {
    path: PathBuf,
    state: SubscriptionState,
}

impl SubscriptionStore {
    /// Reads the document at `path`, creating an empty one when missing.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No subscription file at {}, starting empty", path.display());
            let store = Self {
                path: path.to_path_buf(),
                state: SubscriptionState::default(),
            };
            store.persist()?;
            return Ok(store);
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading subscriptions {}", path.display()))?;
        let state: SubscriptionState = serde_json::from_str(&raw)
            .with_context(|| format!("parsing subscriptions {}", path.display()))?;
        state
            .validate()
            .with_context(|| format!("validating subscriptions {}", path.display()))?;

        debug!(
            subscribing = state.subscribing.len(),
            subscribed = state.subscribed.len(),
            "Loaded subscription state"
        );
        Ok(Self {
            path: path.to_path_buf(),
            state,
        })
    }

    /// Replaces the whole document on disk via a sibling temp file + rename.
    pub fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let payload =
            serde_json::to_vec_pretty(&self.state).context("serializing subscription state")?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, payload)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }

    /// Moves `channel_id` from `subscribing` to `subscribed` and drops its
    /// pending title.
    pub fn promote(&mut self, channel_id: &str) -> Result<()> {
        if self.state.subscribed.iter().any(|id| id == channel_id) {
            return Err(IngestError::Consistency(format!(
                "cannot promote {channel_id}: already subscribed"
            ))
            .into());
        }
        let Some(position) = self
            .state
            .subscribing
            .iter()
            .position(|id| id == channel_id)
        else {
            return Err(IngestError::Consistency(format!(
                "cannot promote {channel_id}: not pending"
            ))
            .into());
        };

        let id = self.state.subscribing.remove(position);
        self.state.titles.remove(&id);
        self.state.subscribed.push(id);
        self.persist()?;
        info!("Promoted {channel_id} to subscribed");
        Ok(())
    }

    /// Queues a channel for its first full sync.
    pub fn subscribe(&mut self, channel_id: &str, title: Option<&str>) -> Result<SubscribeOutcome> {
        if self.state.subscribed.iter().any(|id| id == channel_id) {
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }
        if self.state.subscribing.iter().any(|id| id == channel_id) {
            return Ok(SubscribeOutcome::AlreadyPending);
        }

        self.state.subscribing.push(channel_id.to_string());
        if let Some(title) = title.map(str::trim).filter(|title| !title.is_empty()) {
            self.state
                .titles
                .insert(channel_id.to_string(), title.to_string());
        }
        self.persist()?;
        Ok(SubscribeOutcome::Added)
    }

    pub fn subscribing(&self) -> &[String] {
        &self.state.subscribing
    }

    pub fn subscribed(&self) -> &[String] {
        &self.state.subscribed
    }

    pub fn title(&self, channel_id: &str) -> Option<&str> {
        self.state.titles.get(channel_id).map(String::as_str)
    }
}
