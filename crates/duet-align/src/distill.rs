use std::sync::Arc;

use dt_collective::{connect, Collective, RuntimeKind};
use dt_tensor::Tensor;

use crate::config::LossConfig;
use crate::contrastive::{ContrastiveCore, LossOutput, LossTerms};
use crate::{AlignError, Result};

/// Contrastive alignment plus a teacher-matching term: the student's logit
/// distribution is pulled towards the teacher's via a cross-entropy-form KL
/// surrogate. The teacher path is built through the same logit machinery as
/// the student; suppressing gradients on the teacher side is the caller's
/// responsibility.
#[derive(Debug)]
pub struct DistillationLoss {
    core: ContrastiveCore,
    output_dict: bool,
}

impl DistillationLoss {
    pub fn new(config: &LossConfig) -> Self {
        Self::from_parts(config, None)
    }

    pub fn with_communicator(config: &LossConfig, comm: Arc<dyn Collective>) -> Self {
        Self::from_parts(config, Some(comm))
    }

    pub fn distributed(
        config: &LossConfig,
        runtime: RuntimeKind,
        group: impl Into<String>,
        rank: usize,
        world_size: usize,
    ) -> Result<Self> {
        let comm = connect(runtime, group, rank, world_size)
            .map_err(|err| AlignError::Configuration(err.to_string()))?;
        Ok(Self::with_communicator(config, comm))
    }

    fn from_parts(config: &LossConfig, comm: Option<Arc<dyn Collective>>) -> Self {
        Self {
            core: ContrastiveCore::new(config, comm),
            output_dict: config.output_dict,
        }
    }

    pub fn forward(
        &mut self,
        features_a: &Tensor,
        features_b: &Tensor,
        logit_scale: f32,
        teacher_features_a: &Tensor,
        teacher_features_b: &Tensor,
        teacher_logit_scale: f32,
    ) -> Result<LossOutput> {
        let student = self.core.compute(features_a, features_b, logit_scale)?;
        let teacher = self.core.builder().build(
            teacher_features_a,
            teacher_features_b,
            teacher_logit_scale,
        )?;

        let distill_a = distillation_term(&teacher.per_feature_a, &student.logits.per_feature_a)?;
        let distill_b = distillation_term(&teacher.per_feature_b, &student.logits.per_feature_b)?;
        let distill = 0.5 * (distill_a + distill_b);

        Ok(if self.output_dict {
            LossOutput::Terms(LossTerms {
                contrastive_loss: student.loss,
                caption_loss: None,
                distill_loss: Some(distill),
            })
        } else {
            LossOutput::Pair(student.loss, distill)
        })
    }
}

/// `-(softmax(teacher_row) . log_softmax(student_row))` summed over classes
/// and averaged over rows.
pub fn distillation_term(teacher_logits: &Tensor, student_logits: &Tensor) -> Result<f32> {
    if teacher_logits.shape() != student_logits.shape() {
        return Err(AlignError::Shape(format!(
            "teacher and student logits disagree: {:?} vs {:?}",
            teacher_logits.shape(),
            student_logits.shape()
        )));
    }
    let (rows, cols) = teacher_logits.shape();
    let teacher_probs = teacher_logits.row_softmax()?;
    let student_log_probs = student_logits.row_log_softmax()?;

    let mut total = 0.0f64;
    for (probs, log_probs) in teacher_probs
        .data()
        .chunks(cols)
        .zip(student_log_probs.data().chunks(cols))
    {
        let mut row = 0.0f64;
        for (p, lq) in probs.iter().zip(log_probs.iter()) {
            row += (*p as f64) * (*lq as f64);
        }
        total -= row;
    }
    Ok((total / rows as f64) as f32)
}
