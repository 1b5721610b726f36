//! Background producer of key generation pre-parameters.

use crate::error::{KeepError, KeepResult};
use crate::metrics;
use crate::primitives::ParticipantId;
use crate::registry::evaluation_point;
use crate::tracking;
use k256::elliptic_curve::Field;
use k256::{AffinePoint, ProjectivePoint, Scalar};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A secret polynomial of degree `threshold - 1` and its Feldman commitments,
/// ready to be dealt in a key generation.
#[derive(Clone)]
pub struct PreParams {
    coefficients: Vec<Scalar>,
    commitments: Vec<AffinePoint>,
}

impl std::fmt::Debug for PreParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreParams")
            .field("threshold", &self.threshold())
            .finish_non_exhaustive()
    }
}

impl PreParams {
    pub fn generate(threshold: usize) -> Self {
        let mut rng = rand::thread_rng();
        let coefficients = (0..threshold)
            .map(|_| Scalar::random(&mut rng))
            .collect::<Vec<_>>();
        let commitments = coefficients
            .iter()
            .map(|coefficient| (ProjectivePoint::GENERATOR * coefficient).to_affine())
            .collect();
        Self {
            coefficients,
            commitments,
        }
    }

    /// Generates on the blocking pool, failing after `timeout`.
    pub async fn generate_with_timeout(threshold: usize, timeout: Duration) -> KeepResult<Self> {
        let generation = tokio::task::spawn_blocking(move || Self::generate(threshold));
        match tokio::time::timeout(timeout, generation).await {
            Ok(Ok(params)) => Ok(params),
            Ok(Err(err)) => Err(KeepError::Crypto(format!(
                "pre-parameter generation failed: {}",
                err
            ))),
            Err(_) => Err(KeepError::Crypto(format!(
                "pre-parameter generation timed out after {:?}",
                timeout
            ))),
        }
    }

    pub fn threshold(&self) -> usize {
        self.coefficients.len()
    }

    pub fn commitments(&self) -> &[AffinePoint] {
        &self.commitments
    }

    /// The polynomial evaluated at `member`'s evaluation point.
    pub fn evaluate(&self, member: ParticipantId) -> Scalar {
        let x = evaluation_point(member);
        self.coefficients
            .iter()
            .rev()
            .fold(Scalar::ZERO, |acc, coefficient| acc * x + coefficient)
    }
}

/// Keeps up to `target` pre-parameters for `threshold` ready. Production is
/// single-flight: the pump mutex is taken before the pool mutex.
pub struct PreParamsPool {
    threshold: usize,
    target: usize,
    pool: Mutex<VecDeque<PreParams>>,
    pump: tokio::sync::Mutex<()>,
}

impl PreParamsPool {
    pub fn new(threshold: usize, target: usize) -> Arc<Self> {
        Arc::new(Self {
            threshold,
            target,
            pool: Mutex::new(VecDeque::new()),
            pump: tokio::sync::Mutex::new(()),
        })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn len(&self) -> usize {
        self.pool.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts filling the pool in the background.
    pub fn start(self: &Arc<Self>) {
        tracking::spawn_detached("fill pre-parameter pool", self.clone().pump());
    }

    /// Takes one element without blocking, and triggers a refill. Returns
    /// `None` when the pool is empty or holds pre-parameters for another
    /// threshold.
    pub fn get(self: &Arc<Self>, threshold: usize) -> Option<PreParams> {
        if threshold != self.threshold {
            return None;
        }
        let params = {
            let mut pool = self.pool.lock().unwrap();
            let params = pool.pop_front();
            metrics::KEEP_PRE_PARAMS_AVAILABLE.set(pool.len() as i64);
            params
        };
        self.start();
        params
    }

    /// Pool first; on a miss generates ad hoc within `timeout`.
    pub async fn get_or_generate(
        self: &Arc<Self>,
        threshold: usize,
        timeout: Duration,
    ) -> KeepResult<PreParams> {
        if let Some(params) = self.get(threshold) {
            return Ok(params);
        }
        metrics::KEEP_PRE_PARAMS_POOL_MISSES.inc();
        tracing::info!(threshold, "pre-parameter pool miss, generating ad hoc");
        PreParams::generate_with_timeout(threshold, timeout).await
    }

    async fn pump(self: Arc<Self>) -> anyhow::Result<()> {
        let _pump = self.pump.lock().await;
        loop {
            if self.len() >= self.target {
                return Ok(());
            }
            tracking::set_progress(&format!("{} of {} ready", self.len(), self.target));
            let threshold = self.threshold;
            let params = tokio::task::spawn_blocking(move || PreParams::generate(threshold)).await?;
            let mut pool = self.pool.lock().unwrap();
            pool.push_back(params);
            metrics::KEEP_PRE_PARAMS_AVAILABLE.set(pool.len() as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_for_len(pool: &PreParamsPool, len: usize) {
        for _ in 0..200 {
            if pool.len() == len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool never reached {} elements, has {}", len, pool.len());
    }

    #[test]
    fn test_pre_params_commit_to_their_polynomial() {
        let params = PreParams::generate(3);
        assert_eq!(params.threshold(), 3);
        let member = ParticipantId(4);
        assert_eq!(
            ProjectivePoint::GENERATOR * params.evaluate(member),
            crate::registry::evaluate_commitments(params.commitments(), member)
        );
    }

    #[tokio::test]
    async fn test_pool_fills_to_target_and_refills() {
        let pool = PreParamsPool::new(2, 3);
        assert!(pool.get(2).is_none());
        wait_for_len(&pool, 3).await;
        let params = pool.get(2).unwrap();
        assert_eq!(params.threshold(), 2);
        wait_for_len(&pool, 3).await;
        // Further pumps never overshoot.
        pool.start();
        pool.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.len(), 3);
    }

    #[tokio::test]
    async fn test_other_threshold_takes_the_slow_path() {
        let pool = PreParamsPool::new(2, 1);
        pool.start();
        wait_for_len(&pool, 1).await;
        assert!(pool.get(3).is_none());
        assert_eq!(pool.len(), 1);
        let params = pool
            .get_or_generate(3, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(params.threshold(), 3);
        assert_eq!(pool.len(), 1);
    }
}
