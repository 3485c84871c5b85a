use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Inputs available to a shaping function for one environment step.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShapingInput {
    pub reward: f32,
    /// Probability the policy gave to the executed subgoal.
    pub subgoal_proba: Option<f32>,
    /// Reference probability the subgoal is compared against.
    pub policy_value: Option<f32>,
}

/// `(total, bonus)`: the reward used for learning and its shaping part.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Reshaped {
    pub total: f32,
    pub bonus: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RewardShaping {
    /// Positive rewards scaled, everything else zero.
    Scaled { scale: f32 },
    /// Scaled reward penalised by `ln(subgoal_proba / policy_value)`.
    LogRatio { scale: f32 },
}

impl Default for RewardShaping {
    fn default() -> Self {
        Self::Scaled { scale: 20.0 }
    }
}

impl RewardShaping {
    /// `beta == 0` keeps the plain scaled reward, anything else adds the
    /// log-ratio term.
    pub fn from_beta(beta: f32) -> Self {
        if beta == 0.0 {
            Self::Scaled { scale: 20.0 }
        } else {
            Self::LogRatio { scale: 20.0 }
        }
    }

    pub fn needs_probabilities(&self) -> bool {
        matches!(self, Self::LogRatio { .. })
    }

    /// Fails when the log-ratio variant gets a missing, zero or negative
    /// probability; the ratio is undefined there and is not patched up.
    pub fn reshape(&self, input: ShapingInput) -> Result<Reshaped> {
        match *self {
            Self::Scaled { scale } => Ok(if input.reward > 0.0 {
                Reshaped {
                    total: scale * input.reward,
                    bonus: 0.0,
                }
            } else {
                Reshaped::default()
            }),
            Self::LogRatio { scale } => {
                let (p, v) = match (input.subgoal_proba, input.policy_value) {
                    (Some(p), Some(v)) => (p, v),
                    _ => bail!("log-ratio shaping needs subgoal_proba and policy_value"),
                };
                if !(p > 0.0 && v > 0.0) || !p.is_finite() || !v.is_finite() {
                    bail!("log-ratio shaping undefined for subgoal_proba={p}, policy_value={v}");
                }
                let penalty = -(p / v).ln();
                Ok(if input.reward > 0.0 {
                    Reshaped {
                        total: scale * input.reward + penalty,
                        bonus: penalty,
                    }
                } else {
                    Reshaped {
                        total: penalty,
                        bonus: penalty,
                    }
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(reward: f32, p: f32, v: f32) -> ShapingInput {
        ShapingInput {
            reward,
            subgoal_proba: Some(p),
            policy_value: Some(v),
        }
    }

    #[test]
    fn test_scaled_reward() {
        let shaping = RewardShaping::from_beta(0.0);
        let r = shaping.reshape(input(0.5, 0.2, 0.5)).unwrap();
        assert_eq!(r, Reshaped { total: 10.0, bonus: 0.0 });
        let r = shaping
            .reshape(ShapingInput {
                reward: -1.0,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(r, Reshaped::default());
        assert!(!shaping.needs_probabilities());
    }

    #[test]
    fn test_log_ratio_positive_and_non_positive() {
        let shaping = RewardShaping::from_beta(1.0);
        assert!(shaping.needs_probabilities());

        let r = shaping.reshape(input(1.0, 0.25, 0.5)).unwrap();
        let penalty = -(0.5f32).ln();
        assert!((r.bonus - penalty).abs() < 1e-6);
        assert!((r.total - (20.0 + penalty)).abs() < 1e-5);

        let r = shaping.reshape(input(0.0, 0.5, 0.5)).unwrap();
        assert!(r.total.abs() < 1e-7);
        assert!(r.bonus.abs() < 1e-7);
    }

    #[test]
    fn test_log_ratio_rejects_degenerate_inputs() {
        let shaping = RewardShaping::LogRatio { scale: 20.0 };
        assert!(shaping.reshape(input(1.0, 0.0, 0.5)).is_err());
        assert!(shaping.reshape(input(1.0, 0.5, -0.1)).is_err());
        assert!(shaping.reshape(input(1.0, f32::NAN, 0.5)).is_err());
        assert!(
            shaping
                .reshape(ShapingInput {
                    reward: 1.0,
                    ..Default::default()
                })
                .is_err()
        );
    }

    #[test]
    fn test_shaping_config_json() {
        let s: RewardShaping = serde_json::from_str(r#"{"kind":"log_ratio","scale":5.0}"#).unwrap();
        assert_eq!(s, RewardShaping::LogRatio { scale: 5.0 });
    }
}
