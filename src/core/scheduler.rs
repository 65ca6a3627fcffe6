/// Reduce-on-plateau learning rate policy, minimising the observed metric.
///
/// The metric improves when it drops below `best * (1 - threshold)`. After more
/// than `patience` epochs without improvement the rate is multiplied by
/// `factor` (never below `min_lr`), then the policy waits `cooldown` epochs
/// before counting bad epochs again.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    factor: f64,
    patience: usize,
    threshold: f64,
    cooldown: usize,
    min_lr: f64,
    eps: f64,
    best: f64,
    num_bad_epochs: usize,
    cooldown_counter: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(factor: f64, patience: usize) -> Self {
        assert!(factor > 0.0 && factor < 1.0, "factor must be in (0, 1)");
        Self {
            factor,
            patience,
            threshold: 1e-4,
            cooldown: 0,
            min_lr: 0.0,
            eps: 1e-8,
            best: f64::INFINITY,
            num_bad_epochs: 0,
            cooldown_counter: 0,
        }
    }

    pub fn with_cooldown(mut self, cooldown: usize) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_min_lr(mut self, min_lr: f64) -> Self {
        self.min_lr = min_lr;
        self
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    fn is_better(&self, metric: f64) -> bool {
        // NaN compares false, so it never counts as an improvement.
        metric < self.best * (1.0 - self.threshold)
    }

    /// Feeds one epoch's metric. Returns the reduced rate when `lr` should change.
    pub fn step(&mut self, metric: f64, lr: f64) -> Option<f64> {
        if self.is_better(metric) {
            self.best = metric;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            self.num_bad_epochs = 0;
        }

        if self.num_bad_epochs <= self.patience {
            return None;
        }
        self.cooldown_counter = self.cooldown;
        self.num_bad_epochs = 0;

        let new_lr = (lr * self.factor).max(self.min_lr);
        if lr - new_lr > self.eps {
            Some(new_lr)
        } else {
            None
        }
    }
}
