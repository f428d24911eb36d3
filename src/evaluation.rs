//! Evaluation harness — runs a fixed question set against several models
//! and reports answer accuracy and latency.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::agent_core::driver::ExecutionDriver;
use crate::agent_core::types::round2;

/// A question with a known answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationCase {
    pub question: String,
    pub expected_answer: String,
}

impl EvaluationCase {
    pub fn new(question: &str, expected_answer: &str) -> Self {
        Self {
            question: question.to_string(),
            expected_answer: expected_answer.to_string(),
        }
    }

    /// Case-insensitive containment of the expected answer.
    pub fn is_correct(&self, answer: &str) -> bool {
        answer
            .to_lowercase()
            .contains(&self.expected_answer.to_lowercase())
    }
}

/// Questions over the sample company graph.
pub fn default_cases() -> Vec<EvaluationCase> {
    vec![
        EvaluationCase::new("How many nodes are in the graph?", "28"),
        EvaluationCase::new("How many Products are there?", "7"),
        EvaluationCase::new("How many Employees work for Acme Inc?", "12"),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationPlan {
    pub models: Vec<String>,
    pub iterations: u32,
}

impl Default for EvaluationPlan {
    fn default() -> Self {
        Self {
            models: vec!["llama3.2".into(), "mistral".into(), "qwen3".into()],
            iterations: 3,
        }
    }
}

/// Per-question outcome for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionReport {
    pub question: String,
    pub expected_answer: String,
    /// Runs that returned an answer.
    pub attempts: u32,
    pub correct: u32,
    /// Runs that ended in an error; not counted as attempts.
    pub failed: u32,
    /// Percentage of attempts answered correctly, two decimals.
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelReport {
    pub model: String,
    /// Runs that returned an answer.
    pub iterations_ran: u32,
    /// Mean over successful runs, two decimals.
    pub avg_seconds_to_complete: f64,
    /// Mean of the per-question success rates, two decimals.
    pub overall_success_rate: f64,
    pub questions: Vec<QuestionReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub models: Vec<ModelReport>,
}

/// Accumulates runs for one model.
#[derive(Default)]
struct ModelTally {
    iterations_ran: u32,
    total_seconds: f64,
    questions: Vec<QuestionReport>,
}

impl ModelTally {
    fn finish(self, model: &str) -> ModelReport {
        let avg = if self.iterations_ran > 0 {
            self.total_seconds / f64::from(self.iterations_ran)
        } else {
            0.0
        };
        let overall = if self.questions.is_empty() {
            0.0
        } else {
            self.questions.iter().map(|q| q.success_rate).sum::<f64>()
                / self.questions.len() as f64
        };
        ModelReport {
            model: model.to_string(),
            iterations_ran: self.iterations_ran,
            avg_seconds_to_complete: round2(avg),
            overall_success_rate: round2(overall),
            questions: self.questions,
        }
    }
}

fn success_rate(correct: u32, attempts: u32) -> f64 {
    if attempts == 0 {
        return 0.0;
    }
    round2(f64::from(correct) / f64::from(attempts) * 100.0)
}

/// Run every case `plan.iterations` times for every model.
///
/// Failed runs are logged and reported separately; they are left out of
/// the attempts a success rate is computed over.
pub async fn run_evaluation(
    driver: &ExecutionDriver,
    plan: &EvaluationPlan,
    cases: &[EvaluationCase],
) -> EvaluationReport {
    let mut report = EvaluationReport::default();

    for model in &plan.models {
        tracing::info!(model = %model, cases = cases.len(), iterations = plan.iterations, "evaluating model");
        let mut tally = ModelTally::default();

        for case in cases {
            let mut correct = 0;
            let mut failed = 0;

            for attempt in 1..=plan.iterations {
                match driver.run(&case.question, model, false).await {
                    Ok(result) => {
                        tally.iterations_ran += 1;
                        tally.total_seconds += result.elapsed_seconds;
                        let ok = case.is_correct(&result.interpreted_answer);
                        if ok {
                            correct += 1;
                        }
                        tracing::info!(
                            model = %model,
                            attempt,
                            answer = %result.interpreted_answer,
                            elapsed_secs = round2(result.elapsed_seconds),
                            correct = ok,
                            "evaluation attempt"
                        );
                    }
                    Err(e) => {
                        failed += 1;
                        tracing::warn!(model = %model, attempt, error = %e, "evaluation attempt failed");
                    }
                }
            }

            let attempts = plan.iterations - failed;
            tally.questions.push(QuestionReport {
                question: case.question.clone(),
                expected_answer: case.expected_answer.clone(),
                attempts,
                correct,
                failed,
                success_rate: success_rate(correct, attempts),
            });
        }

        report.models.push(tally.finish(model));
    }

    report
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Evaluation Results:")?;
        for model in &self.models {
            writeln!(f, "Model: {}", model.model)?;
            writeln!(f, "Iterations Ran: {}", model.iterations_ran)?;
            writeln!(f, "Average Seconds to Complete: {}", model.avg_seconds_to_complete)?;
            writeln!(f, "Overall Success Rate: {}%", model.overall_success_rate)?;
            writeln!(f, "Success Rates:")?;
            for q in &model.questions {
                writeln!(
                    f,
                    "  {}: {}% ({}/{} correct, {} failed)",
                    q.question, q.success_rate, q.correct, q.attempts, q.failed
                )?;
            }
            writeln!(f, "{}", "-".repeat(50))?;
        }
        Ok(())
    }
}
