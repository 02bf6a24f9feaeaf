//! Storage backends shared by every worker taking part in a study.

use chrono::{DateTime, Utc};
use hpo_types::{Distribution, HpoResult, ParameterValue, StudyError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::trial::{FrozenTrial, ObjectiveDirection, StudyId, TrialId, TrialState};

/// Stored identity of a study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyRecord {
    pub id: StudyId,
    pub name: String,
    pub direction: ObjectiveDirection,
    pub created_at: DateTime<Utc>,
}

impl StudyRecord {
    pub fn new(name: &str, direction: ObjectiveDirection) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            direction,
            created_at: Utc::now(),
        }
    }
}

/// Backend holding studies and trials.
///
/// Implementations must allocate trial numbers atomically and record a
/// trial's terminal state exactly once; every worker process relies on that.
pub trait StudyStorage: Send + Sync {
    /// Create the study, or return the existing one with the same name.
    fn get_or_create_study(
        &self,
        name: &str,
        direction: ObjectiveDirection,
    ) -> HpoResult<StudyRecord>;

    fn find_study(&self, name: &str) -> HpoResult<Option<StudyRecord>>;

    /// Remove a study and all its trials. Unknown names are `NotFound`.
    fn delete_study(&self, name: &str) -> HpoResult<()>;

    fn list_studies(&self) -> HpoResult<Vec<StudyRecord>>;

    /// Allocate the next trial of a study in the `Running` state.
    fn create_trial(&self, study_id: StudyId) -> HpoResult<FrozenTrial>;

    fn set_trial_param(
        &self,
        trial_id: TrialId,
        name: &str,
        distribution: &Distribution,
        value: ParameterValue,
    ) -> HpoResult<()>;

    fn set_intermediate_value(&self, trial_id: TrialId, step: u64, value: f64) -> HpoResult<()>;

    /// Move a running trial to its terminal state.
    fn finish_trial(
        &self,
        trial_id: TrialId,
        state: TrialState,
        value: Option<f64>,
    ) -> HpoResult<FrozenTrial>;

    fn get_trial(&self, trial_id: TrialId) -> HpoResult<FrozenTrial>;

    /// All trials of a study ordered by number.
    fn get_all_trials(&self, study_id: StudyId) -> HpoResult<Vec<FrozenTrial>>;
}

pub(crate) fn trial_not_found(trial_id: TrialId) -> StudyError {
    StudyError::TrialNotFound {
        trial_id: trial_id.to_string(),
    }
}

pub(crate) fn check_running(trial: &FrozenTrial) -> HpoResult<()> {
    if trial.state.is_finished() {
        return Err(StudyError::TrialAlreadyFinished {
            number: trial.number,
            state: trial.state.to_string(),
        }
        .into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    studies: BTreeMap<String, StudyRecord>,
    trials: HashMap<TrialId, FrozenTrial>,
    next_number: HashMap<StudyId, u64>,
}

/// Process-local storage. Used for studies that are not shared through the
/// database and for tests.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    state: RwLock<MemoryState>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_trial<T>(
        &self,
        trial_id: TrialId,
        f: impl FnOnce(&mut FrozenTrial) -> HpoResult<T>,
    ) -> HpoResult<T> {
        let mut state = self.state.write();
        let trial = state
            .trials
            .get_mut(&trial_id)
            .ok_or_else(|| trial_not_found(trial_id))?;
        f(trial)
    }
}

impl StudyStorage for InMemoryStorage {
    fn get_or_create_study(
        &self,
        name: &str,
        direction: ObjectiveDirection,
    ) -> HpoResult<StudyRecord> {
        let mut state = self.state.write();
        let record = state
            .studies
            .entry(name.to_string())
            .or_insert_with(|| StudyRecord::new(name, direction));
        Ok(record.clone())
    }

    fn find_study(&self, name: &str) -> HpoResult<Option<StudyRecord>> {
        Ok(self.state.read().studies.get(name).cloned())
    }

    fn delete_study(&self, name: &str) -> HpoResult<()> {
        let mut state = self.state.write();
        let record = state.studies.remove(name).ok_or_else(|| StudyError::NotFound {
            name: name.to_string(),
        })?;
        state.trials.retain(|_, trial| trial.study_id != record.id);
        state.next_number.remove(&record.id);
        Ok(())
    }

    fn list_studies(&self) -> HpoResult<Vec<StudyRecord>> {
        Ok(self.state.read().studies.values().cloned().collect())
    }

    fn create_trial(&self, study_id: StudyId) -> HpoResult<FrozenTrial> {
        let mut state = self.state.write();
        if !state.studies.values().any(|s| s.id == study_id) {
            return Err(StudyError::NotFound {
                name: study_id.to_string(),
            }
            .into());
        }
        let counter = state.next_number.entry(study_id).or_insert(0);
        let trial = FrozenTrial::new(study_id, *counter);
        *counter += 1;
        state.trials.insert(trial.id, trial.clone());
        Ok(trial)
    }

    fn set_trial_param(
        &self,
        trial_id: TrialId,
        name: &str,
        distribution: &Distribution,
        value: ParameterValue,
    ) -> HpoResult<()> {
        self.with_trial(trial_id, |trial| {
            check_running(trial)?;
            trial.params.insert(name.to_string(), value);
            trial
                .distributions
                .insert(name.to_string(), distribution.clone());
            Ok(())
        })
    }

    fn set_intermediate_value(&self, trial_id: TrialId, step: u64, value: f64) -> HpoResult<()> {
        self.with_trial(trial_id, |trial| {
            check_running(trial)?;
            trial.intermediate_values.entry(step).or_insert(value);
            Ok(())
        })
    }

    fn finish_trial(
        &self,
        trial_id: TrialId,
        state: TrialState,
        value: Option<f64>,
    ) -> HpoResult<FrozenTrial> {
        self.with_trial(trial_id, |trial| {
            check_running(trial)?;
            trial.state = state;
            trial.value = value;
            trial.finished_at = Some(Utc::now());
            Ok(trial.clone())
        })
    }

    fn get_trial(&self, trial_id: TrialId) -> HpoResult<FrozenTrial> {
        self.state
            .read()
            .trials
            .get(&trial_id)
            .cloned()
            .ok_or_else(|| trial_not_found(trial_id).into())
    }

    fn get_all_trials(&self, study_id: StudyId) -> HpoResult<Vec<FrozenTrial>> {
        let state = self.state.read();
        let mut trials: Vec<FrozenTrial> = state
            .trials
            .values()
            .filter(|t| t.study_id == study_id)
            .cloned()
            .collect();
        trials.sort_by_key(|t| t.number);
        Ok(trials)
    }
}
