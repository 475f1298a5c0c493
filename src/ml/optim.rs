use ndarray::{Array, Dimension, Zip};

use super::tcn::TcnParams;

/// Adam with bias correction and a fixed learning rate
///
/// m = b1*m + (1-b1)*g
/// v = b2*v + (1-b2)*g^2
/// p = p - lr * m_hat / (sqrt(v_hat) + eps)
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    step: i32,
    m: Option<TcnParams>,
    v: Option<TcnParams>,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            step: 0,
            m: None,
            v: None,
        }
    }

    pub fn steps_taken(&self) -> i32 {
        self.step
    }

    pub fn step(&mut self, params: &mut TcnParams, grads: &TcnParams) {
        let m = self.m.get_or_insert_with(|| grads.zeros_like());
        let v = self.v.get_or_insert_with(|| grads.zeros_like());
        self.step += 1;

        let update = AdamUpdate {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            epsilon: self.epsilon,
            correction1: 1.0 - self.beta1.powi(self.step),
            correction2: 1.0 - self.beta2.powi(self.step),
        };

        update.apply(&mut params.conv1_weight, &grads.conv1_weight, &mut m.conv1_weight, &mut v.conv1_weight);
        update.apply(&mut params.conv1_bias, &grads.conv1_bias, &mut m.conv1_bias, &mut v.conv1_bias);
        update.apply(&mut params.conv2_weight, &grads.conv2_weight, &mut m.conv2_weight, &mut v.conv2_weight);
        update.apply(&mut params.conv2_bias, &grads.conv2_bias, &mut m.conv2_bias, &mut v.conv2_bias);
        update.apply(&mut params.fc_weight, &grads.fc_weight, &mut m.fc_weight, &mut v.fc_weight);
        update.apply(&mut params.fc_bias, &grads.fc_bias, &mut m.fc_bias, &mut v.fc_bias);
    }
}

struct AdamUpdate {
    lr: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    correction1: f64,
    correction2: f64,
}

impl AdamUpdate {
    fn apply<D: Dimension>(
        &self,
        param: &mut Array<f64, D>,
        grad: &Array<f64, D>,
        m: &mut Array<f64, D>,
        v: &mut Array<f64, D>,
    ) {
        Zip::from(param).and(grad).and(m).and(v).for_each(|p, &g, m, v| {
            *m = self.beta1 * *m + (1.0 - self.beta1) * g;
            *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
            let m_hat = *m / self.correction1;
            let v_hat = *v / self.correction2;
            *p -= self.lr * m_hat / (v_hat.sqrt() + self.epsilon);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut params = TcnParams::init(2, 1, &mut rng);
        let before = params.clone();

        let mut grads = params.zeros_like();
        grads.fc_bias[0] = 0.5;
        grads.conv1_bias[3] = -2.0;

        let mut adam = Adam::new(1e-3);
        adam.step(&mut params, &grads);

        // With bias correction the first update is lr * sign(g)
        assert!((before.fc_bias[0] - params.fc_bias[0] - 1e-3).abs() < 1e-9);
        assert!((params.conv1_bias[3] - before.conv1_bias[3] - 1e-3).abs() < 1e-9);
        assert_eq!(params.conv2_weight, before.conv2_weight);
        assert_eq!(adam.steps_taken(), 1);
    }
}
