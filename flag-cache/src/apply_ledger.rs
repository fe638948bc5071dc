//! # Apply ledger
//!
//! Durable record of which flags were used under which resolve token, and
//! whether each use has been reported to the backend yet.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::error::{LedgerError, StorageError};
use crate::metrics_consts::{
    APPLY_DEDUPLICATED_COUNTER, APPLY_RECORDED_COUNTER, STORAGE_WRITE_ERROR_COUNTER,
};
use crate::storage::{encode, load_or_reset, Storage};
use crate::types::{AppliedFlag, ApplyRecord, ApplyStatus, ResolveEventGroup, Transition};

/// How many resolve tokens we remember terminal outcomes for after their records are gone.
const MAX_SETTLED_TOKENS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// A new record was appended and persisted.
    Recorded,
    /// The flag is already waiting for delivery under this token; nothing changed.
    AlreadyTracked,
}

/// Terminal outcomes of records that left the ledger, kept in memory only so
/// that a flag delivered under a token is not reported again while this
/// process runs.
#[derive(Debug, Default)]
struct SettledOutcomes {
    tokens: VecDeque<(String, HashMap<String, ApplyStatus>)>,
}

impl SettledOutcomes {
    fn get(&self, token: &str, flag: &str) -> Option<ApplyStatus> {
        self.tokens
            .iter()
            .find(|(settled_token, _)| settled_token == token)
            .and_then(|(_, flags)| flags.get(flag).copied())
    }

    fn knows_token(&self, token: &str) -> bool {
        self.tokens.iter().any(|(settled_token, _)| settled_token == token)
    }

    fn settle(&mut self, token: &str, flag: &str, status: ApplyStatus) {
        if let Some((_, flags)) = self
            .tokens
            .iter_mut()
            .find(|(settled_token, _)| settled_token == token)
        {
            flags.insert(flag.to_owned(), status);
            return;
        }

        if self.tokens.len() == MAX_SETTLED_TOKENS {
            self.tokens.pop_front();
        }
        self.tokens.push_back((
            token.to_owned(),
            HashMap::from([(flag.to_owned(), status)]),
        ));
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    groups: Vec<ResolveEventGroup>,
    settled: SettledOutcomes,
}

impl LedgerState {
    fn group_index(&self, token: &str) -> Option<usize> {
        self.groups
            .iter()
            .position(|group| group.resolve_token == token)
    }

    fn record_mut(&mut self, token: &str, flag: &str) -> Option<&mut ApplyRecord> {
        self.groups
            .iter_mut()
            .find(|group| group.resolve_token == token)?
            .records
            .iter_mut()
            .find(|record| record.flag_name == flag)
    }

    fn status(&self, token: &str, flag: &str) -> ApplyStatus {
        let record = self
            .groups
            .iter()
            .find(|group| group.resolve_token == token)
            .and_then(|group| group.records.iter().find(|record| record.flag_name == flag));

        match record {
            Some(record) if record.sent => ApplyStatus::Applied,
            Some(_) => ApplyStatus::Applying,
            None => self
                .settled
                .get(token, flag)
                .unwrap_or(ApplyStatus::NotApplied),
        }
    }

    fn is_tracked(&self, token: &str) -> bool {
        self.group_index(token).is_some() || self.settled.knows_token(token)
    }

    /// Check that `flag` may move to `next`, without changing anything.
    fn check_transition(
        &self,
        token: &str,
        flag: &str,
        next: ApplyStatus,
    ) -> Result<Transition, LedgerError> {
        let current = self.status(token, flag);
        current
            .transition(next)
            .ok_or_else(|| LedgerError::IllegalApplyTransition {
                token: token.to_owned(),
                flag: flag.to_owned(),
                from: current,
                to: next,
            })
    }

    /// Delete a record, and its group once empty. Returns the removed record.
    fn take_record(&mut self, token: &str, flag: &str) -> Option<ApplyRecord> {
        let index = self.group_index(token)?;
        let group = &mut self.groups[index];
        let position = group
            .records
            .iter()
            .position(|record| record.flag_name == flag)?;
        let record = group.records.remove(position);

        if group.records.is_empty() {
            self.groups.remove(index);
        }

        Some(record)
    }
}

/// Restore the ledger invariants on data loaded from storage: no empty groups,
/// no duplicate tokens, at most one record per flag in a group (first one wins).
fn normalize(groups: Vec<ResolveEventGroup>) -> Vec<ResolveEventGroup> {
    let mut normalized: Vec<ResolveEventGroup> = Vec::with_capacity(groups.len());

    for group in groups {
        let target = match normalized
            .iter()
            .position(|existing| existing.resolve_token == group.resolve_token)
        {
            Some(index) => index,
            None => {
                normalized.push(ResolveEventGroup {
                    resolve_token: group.resolve_token.clone(),
                    records: Vec::new(),
                });
                normalized.len() - 1
            }
        };

        for record in group.records {
            let records = &mut normalized[target].records;
            if records.iter().any(|r| r.flag_name == record.flag_name) {
                warn!(
                    resolve_token = group.resolve_token,
                    flag = record.flag_name,
                    "dropping duplicate apply record"
                );
                continue;
            }
            records.push(record);
        }
    }

    normalized.retain(|group| !group.records.is_empty());
    normalized
}

/// Tracks apply events per resolve token and persists every change.
///
/// Uses the same discipline as `ResolveCache`: one `RwLock` for the state,
/// plus a writer mutex that serializes mutations together with their
/// persistence. Failed mutations leave both memory and storage untouched.
pub struct ApplyLedger {
    state: RwLock<LedgerState>,
    writer: Mutex<()>,
    storage: Arc<dyn Storage>,
}

impl ApplyLedger {
    /// Build a ledger from whatever `storage` holds. A corrupted ledger is
    /// wiped and the ledger starts empty. A ledger that cannot be read is left
    /// alone and the error is returned.
    pub fn new(storage: Arc<dyn Storage>) -> Result<Self, StorageError> {
        let groups = normalize(load_or_reset(storage.as_ref())?);
        let pending: usize = groups.iter().map(|group| group.records.len()).sum();
        info!(
            location = %storage.location(),
            tokens = groups.len(),
            pending,
            "loaded apply ledger"
        );

        Ok(Self {
            state: RwLock::new(LedgerState {
                groups,
                settled: SettledOutcomes::default(),
            }),
            writer: Mutex::new(()),
            storage,
        })
    }

    /// Record that `flag` was used under `resolve_token` at `at`.
    ///
    /// Only the first use of a flag under a token creates a record; later uses
    /// keep the original `applied_at` and return `AlreadyTracked`.
    pub fn record(
        &self,
        resolve_token: &str,
        flag: &str,
        at: DateTime<Utc>,
    ) -> Result<RecordOutcome, LedgerError> {
        let outcome = self.mutate(|state| {
            match state.check_transition(resolve_token, flag, ApplyStatus::Applying)? {
                Transition::AlreadyInFlight => Ok((RecordOutcome::AlreadyTracked, false)),
                Transition::Advanced => {
                    let record = ApplyRecord {
                        flag_name: flag.to_owned(),
                        applied_at: at,
                        sent: false,
                    };
                    match state.group_index(resolve_token) {
                        Some(index) => state.groups[index].records.push(record),
                        None => state.groups.push(ResolveEventGroup {
                            resolve_token: resolve_token.to_owned(),
                            records: vec![record],
                        }),
                    }
                    Ok((RecordOutcome::Recorded, true))
                }
            }
        })?;

        match outcome {
            RecordOutcome::Recorded => {
                debug!(resolve_token, flag, "recorded apply event");
                metrics::counter!(APPLY_RECORDED_COUNTER).increment(1);
            }
            RecordOutcome::AlreadyTracked => {
                metrics::counter!(APPLY_DEDUPLICATED_COUNTER).increment(1);
            }
        }

        Ok(outcome)
    }

    /// Mark the record of `flag` as delivered. The record stays in the ledger
    /// until `remove` is called for it.
    pub fn mark_sent(&self, resolve_token: &str, flag: &str) -> Result<(), LedgerError> {
        self.mutate(|state| {
            if !state.is_tracked(resolve_token) {
                return Err(LedgerError::StaleResolveToken(resolve_token.to_owned()));
            }
            state.check_transition(resolve_token, flag, ApplyStatus::Applied)?;
            if let Some(record) = state.record_mut(resolve_token, flag) {
                record.sent = true;
            }
            Ok(((), true))
        })
    }

    /// Give up on the record of `flag`: it is dropped from the ledger without
    /// being marked as sent, and will not be recorded again under this token.
    pub fn mark_failed(&self, resolve_token: &str, flag: &str) -> Result<(), LedgerError> {
        self.mutate(|state| {
            if !state.is_tracked(resolve_token) {
                return Err(LedgerError::StaleResolveToken(resolve_token.to_owned()));
            }
            state.check_transition(resolve_token, flag, ApplyStatus::ApplyFailed)?;
            state.take_record(resolve_token, flag);
            state
                .settled
                .settle(resolve_token, flag, ApplyStatus::ApplyFailed);
            Ok(((), true))
        })
    }

    /// Delete the record of `flag`, and its group if it was the last one.
    /// Removing a record that does not exist is a no-op. Returns whether a record was removed.
    pub fn remove(&self, resolve_token: &str, flag: &str) -> bool {
        let removed = self.mutate(|state| match state.take_record(resolve_token, flag) {
            Some(record) => {
                if record.sent {
                    state
                        .settled
                        .settle(resolve_token, flag, ApplyStatus::Applied);
                }
                Ok((true, true))
            }
            None => Ok((false, false)),
        });

        removed.unwrap_or(false)
    }

    /// Remove every record of a delivered batch and settle it as `Applied`,
    /// persisting the ledger once. Records no longer in the ledger are skipped.
    /// Returns how many records were removed.
    pub fn settle_delivered(&self, flags: &[AppliedFlag]) -> usize {
        let settled = self.mutate(|state| {
            let mut settled = 0;
            for applied in flags {
                let token = applied.resolve_token.as_str();
                let flag = applied.flag_name.as_str();
                if state.take_record(token, flag).is_none() {
                    warn!(
                        resolve_token = token,
                        flag,
                        "delivered apply event was no longer pending"
                    );
                    continue;
                }
                state.settled.settle(token, flag, ApplyStatus::Applied);
                settled += 1;
            }
            Ok((settled, settled > 0))
        });

        settled.unwrap_or(0)
    }

    /// Remove every record of a rejected batch and settle it as `ApplyFailed`,
    /// persisting the ledger once. A record already marked as sent is settled
    /// as `Applied` instead. Returns how many records were removed.
    pub fn settle_rejected(&self, flags: &[AppliedFlag]) -> usize {
        let settled = self.mutate(|state| {
            let mut settled = 0;
            for applied in flags {
                let token = applied.resolve_token.as_str();
                let flag = applied.flag_name.as_str();
                let Some(record) = state.take_record(token, flag) else {
                    warn!(
                        resolve_token = token,
                        flag,
                        "rejected apply event was no longer pending"
                    );
                    continue;
                };
                let status = if record.sent {
                    ApplyStatus::Applied
                } else {
                    ApplyStatus::ApplyFailed
                };
                state.settled.settle(token, flag, status);
                settled += 1;
            }
            Ok((settled, settled > 0))
        });

        settled.unwrap_or(0)
    }

    /// Remove every record already marked as sent, settling it as `Applied`.
    /// These are left behind when a process stops between `mark_sent` and
    /// `remove`. Persists at most once and returns how many records were removed.
    pub fn remove_sent(&self) -> usize {
        let removed = self.mutate(|state| {
            let mut removed = Vec::new();
            for group in state.groups.iter_mut() {
                let token = &group.resolve_token;
                group.records.retain(|record| {
                    if record.sent {
                        removed.push((token.clone(), record.flag_name.clone()));
                    }
                    !record.sent
                });
            }
            state.groups.retain(|group| !group.records.is_empty());

            for (token, flag) in &removed {
                state.settled.settle(token, flag, ApplyStatus::Applied);
            }
            Ok((removed.len(), !removed.is_empty()))
        });

        removed.unwrap_or(0)
    }

    /// Groups with at least one record still waiting for delivery, holding only
    /// those records, in the order tokens were first used.
    pub fn pending_groups(&self) -> Vec<ResolveEventGroup> {
        self.read_state()
            .groups
            .iter()
            .filter_map(|group| {
                let records: Vec<ApplyRecord> = group
                    .records
                    .iter()
                    .filter(|record| !record.sent)
                    .cloned()
                    .collect();
                (!records.is_empty()).then(|| ResolveEventGroup {
                    resolve_token: group.resolve_token.clone(),
                    records,
                })
            })
            .collect()
    }

    pub fn status(&self, resolve_token: &str, flag: &str) -> ApplyStatus {
        self.read_state().status(resolve_token, flag)
    }

    /// A copy of every tracked group, sent records included.
    pub fn groups(&self) -> Vec<ResolveEventGroup> {
        self.read_state().groups.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.read_state()
            .groups
            .iter()
            .flat_map(|group| group.records.iter())
            .filter(|record| !record.sent)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.read_state().groups.is_empty()
    }

    /// Apply `mutation` under exclusive access and persist the ledger if it
    /// reports a change. Errors leave the state untouched.
    fn mutate<T>(
        &self,
        mutation: impl FnOnce(&mut LedgerState) -> Result<(T, bool), LedgerError>,
    ) -> Result<T, LedgerError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let (outcome, encoded) = {
            let mut state = self.write_state();
            let (outcome, changed) = mutation(&mut state)?;
            (outcome, changed.then(|| encode(&state.groups)))
        };

        if let Some(encoded) = encoded {
            if let Err(e) = encoded.and_then(|bytes| self.storage.save(&bytes)) {
                self.report_write_error(e);
            }
        }

        Ok(outcome)
    }

    fn read_state(&self) -> RwLockReadGuard<'_, LedgerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, LedgerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn report_write_error(&self, e: StorageError) {
        error!(
            location = %self.storage.location(),
            "failed to persist apply ledger: {}", e
        );
        metrics::counter!(STORAGE_WRITE_ERROR_COUNTER, "component" => "apply_ledger")
            .increment(1);
    }
}
