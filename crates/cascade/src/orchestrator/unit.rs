//! Production of a single unit: sub-steps, checkpoints, parsing, writing.

use serde_json::{Map, Value};

use super::Orchestrator;
use crate::collaborator::StepRequest;
use crate::error::CascadeError;
use crate::guard::TimeoutGuard;
use crate::job::{Checkpoint, JobRecord};
use crate::parse::{parse_with_repair, ParseResult};
use crate::preflight::ReadyUnit;
use crate::sanitize::{normalize_meta, strip_quotes};
use crate::unit::{Dimension, ProducedUnit};
use crate::writer::{WriteError, WriteOutcome, TITLE_FIELDS};

#[derive(Debug)]
pub(crate) enum UnitOutcome {
    Written(WriteOutcome),
    /// Budget ran out before sub-step `step`; earlier steps are checkpointed.
    /// `step` equals the step count when only the write was left.
    Interrupted { step: usize },
    Failed { error: String, halt: bool },
}

/// Flattens step outputs into one body. Object outputs contribute their
/// fields (later steps win); anything else is kept under the step name.
pub(crate) fn merge_outputs(steps: &[String], outputs: &std::collections::BTreeMap<String, Value>) -> Value {
    let mut body = Map::new();
    for step in steps {
        match outputs.get(step) {
            Some(Value::Object(fields)) => {
                for (k, v) in fields {
                    body.insert(k.clone(), v.clone());
                }
            }
            Some(other) => {
                body.insert(step.clone(), other.clone());
            }
            None => {}
        }
    }
    normalize_meta(&mut body);
    Value::Object(body)
}

/// The display title of a produced body.
pub(crate) fn title_of(body: &Value) -> Option<String> {
    TITLE_FIELDS
        .iter()
        .filter_map(|f| body.get(*f).and_then(Value::as_str))
        .map(strip_quotes)
        .find(|t| !t.is_empty())
}

impl Orchestrator {
    pub(crate) async fn produce_unit(
        &self,
        job: &JobRecord,
        ready: &ReadyUnit,
        dimension: &Dimension,
        guard: &TimeoutGuard,
    ) -> Result<UnitOutcome, CascadeError> {
        let source = &ready.source;
        let key = source.key_for(dimension);
        let steps = self.generator.steps(&job.spec.pipeline);

        let mut checkpoint = self.jobs.load_checkpoint(&job.id, &key)?.unwrap_or_default();
        if checkpoint.next_step > steps.len()
            || checkpoint.outputs.keys().any(|k| !steps.contains(k))
        {
            log::warn!(
                "Job {}: checkpoint for {} does not match pipeline steps, starting over",
                job.id,
                key
            );
            checkpoint = Checkpoint::default();
        } else if checkpoint.next_step > 0 {
            log::info!(
                "Job {}: resuming {} at step {}/{}",
                job.id,
                key,
                checkpoint.next_step + 1,
                steps.len()
            );
        }

        for (index, step) in steps.iter().enumerate().skip(checkpoint.next_step) {
            if guard.exceeded() {
                if index > 0 {
                    checkpoint.next_step = index;
                    self.jobs.save_checkpoint(&job.id, &key, &checkpoint)?;
                }
                return Ok(UnitOutcome::Interrupted { step: index });
            }

            let request = StepRequest {
                pipeline: job.spec.pipeline.clone(),
                step: step.clone(),
                step_index: index,
                key: key.clone(),
                source_dimension: source.dimension.clone(),
                source_title: source.title.clone(),
                source_body: source.body.clone(),
                previous: checkpoint.outputs.clone(),
            };
            match self.run_step(&request, guard).await {
                Ok(value) => {
                    checkpoint.outputs.insert(step.clone(), value);
                    checkpoint.next_step = index + 1;
                }
                Err(failure) => {
                    if index > 0 {
                        self.jobs.save_checkpoint(&job.id, &key, &checkpoint)?;
                    }
                    return Ok(failure);
                }
            }
        }

        let body = merge_outputs(&steps, &checkpoint.outputs);
        let Some(title) = title_of(&body) else {
            return Ok(UnitOutcome::Failed {
                error: format!("output for {} has no title field", key),
                halt: false,
            });
        };

        let unit = ProducedUnit {
            key,
            scope_id: source.scope_id.clone(),
            ordinal: source.ordinal,
            grouping_key: source.group_key().to_string(),
            title,
            body,
            link_id: ready.link_id.clone(),
        };
        match self.writer.write(&unit, guard).await {
            Ok(outcome) => {
                self.jobs.delete_checkpoint(&job.id, &unit.key)?;
                Ok(UnitOutcome::Written(outcome))
            }
            Err(WriteError::OutOfTime { .. }) => {
                checkpoint.next_step = steps.len();
                self.jobs.save_checkpoint(&job.id, &unit.key, &checkpoint)?;
                Ok(UnitOutcome::Interrupted { step: steps.len() })
            }
            Err(e) => Ok(UnitOutcome::Failed {
                error: e.to_string(),
                halt: false,
            }),
        }
    }

    /// One sub-step: retried call, parse, one repair, one re-request.
    /// The re-request is not started once the budget is spent.
    async fn run_step(
        &self,
        request: &StepRequest,
        guard: &TimeoutGuard,
    ) -> Result<Value, UnitOutcome> {
        let label = format!("{} step '{}'", request.key, request.step);
        let generator = &self.generator;
        let mut last_reason = String::new();

        for round in 0..2 {
            if round > 0 && guard.exceeded() {
                log::info!("{}: budget spent before re-request", label);
                return Err(UnitOutcome::Interrupted {
                    step: request.step_index,
                });
            }
            let raw = match self.retry.run(&label, |_| generator.produce(request)).await {
                Ok(raw) => raw,
                Err(e) => {
                    return Err(UnitOutcome::Failed {
                        halt: e.inner().halts_job(),
                        error: e.to_string(),
                    })
                }
            };
            match parse_with_repair::<Map<String, Value>>(&raw) {
                ParseResult::Ok(fields) => return Ok(Value::Object(fields)),
                ParseResult::Repairable(reason) | ParseResult::Malformed(reason) => {
                    if round == 0 {
                        log::warn!("{}: malformed output ({}), requesting again", label, reason);
                    }
                    last_reason = reason;
                }
            }
        }

        Err(UnitOutcome::Failed {
            error: format!("Malformed collaborator output: {}", last_reason),
            halt: false,
        })
    }
}
