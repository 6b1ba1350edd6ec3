use parley_types::models::{CostMode, Usage};

/// Per-token rates of one billing tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierRates {
    pub prompt: f64,
    pub completion: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricingCalculator {
    pub full: TierRates,
    pub reduced: TierRates,
    /// Flat rate charged per minute of uploaded audio.
    pub audio_per_minute: f64,
}

impl Default for PricingCalculator {
    fn default() -> Self {
        Self {
            full: TierRates {
                prompt: 0.000_002_5,
                completion: 0.000_01,
            },
            reduced: TierRates {
                prompt: 0.000_000_15,
                completion: 0.000_000_6,
            },
            audio_per_minute: 0.006,
        }
    }
}

impl PricingCalculator {
    pub fn rates(&self, mode: CostMode) -> TierRates {
        match mode {
            CostMode::Full => self.full,
            CostMode::Reduced => self.reduced,
        }
    }

    pub fn price(&self, usage: &Usage, mode: CostMode) -> f64 {
        let rates = self.rates(mode);
        f64::from(usage.prompt_tokens) * rates.prompt
            + f64::from(usage.completion_tokens) * rates.completion
    }

    /// Cost of `usage` under both tiers, as stored on the usage record.
    pub fn costs(&self, usage: &Usage) -> (f64, f64) {
        (
            self.price(usage, CostMode::Full),
            self.price(usage, CostMode::Reduced),
        )
    }

    pub fn audio_cost(&self, minutes: f64) -> f64 {
        if minutes.is_finite() && minutes > 0.0 {
            minutes * self.audio_per_minute
        } else {
            0.0
        }
    }
}
