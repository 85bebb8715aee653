use log::debug;
use rand::RngCore;
use sample_consensus::{Consensus, Estimator, Model};

/// Plain RANSAC with a fixed iteration cap.
///
/// Each iteration fits the estimator to a random minimal sample and scores every
/// hypothesis by its inlier count, breaking ties by the summed residual of the inliers.
/// Iteration stops early once a hypothesis explains every datum.
#[derive(Debug, Clone)]
pub struct Ransac<R> {
    threshold: f64,
    max_iterations: usize,
    rng: R,
}

impl<R: RngCore> Ransac<R> {
    /// `threshold` is the residual under which a datum is an inlier.
    pub fn new(threshold: f64, max_iterations: usize, rng: R) -> Self {
        Self {
            threshold,
            max_iterations,
            rng,
        }
    }
}

impl<E, R, Data> Consensus<E, Data> for Ransac<R>
where
    E: Estimator<Data>,
    R: RngCore,
    Data: Clone,
{
    type Inliers = Vec<usize>;

    fn model<I>(&mut self, estimator: &E, data: I) -> Option<E::Model>
    where
        I: Iterator<Item = Data> + Clone,
    {
        self.model_inliers(estimator, data).map(|(model, _)| model)
    }

    fn model_inliers<I>(&mut self, estimator: &E, data: I) -> Option<(E::Model, Self::Inliers)>
    where
        I: Iterator<Item = Data> + Clone,
    {
        let data: Vec<Data> = data.collect();
        if data.len() < E::MIN_SAMPLES {
            return None;
        }
        let mut best: Option<(E::Model, Vec<usize>, f64)> = None;
        for iteration in 0..self.max_iterations {
            let sample = rand::seq::index::sample(&mut self.rng, data.len(), E::MIN_SAMPLES).into_vec();
            for model in estimator.estimate(sample.iter().map(|&ix| data[ix].clone())) {
                let mut inliers = vec![];
                let mut score = 0.0;
                for (ix, datum) in data.iter().enumerate() {
                    let residual = model.residual(datum);
                    if residual < self.threshold {
                        inliers.push(ix);
                        score += residual;
                    }
                }
                let better = best.as_ref().map_or(true, |(_, best_inliers, best_score)| {
                    inliers.len() > best_inliers.len()
                        || (inliers.len() == best_inliers.len() && score < *best_score)
                });
                if better {
                    best = Some((model, inliers, score));
                }
            }
            if best
                .as_ref()
                .map_or(false, |(_, inliers, _)| inliers.len() == data.len())
            {
                debug!("ransac explained all data after {} iterations", iteration + 1);
                break;
            }
        }
        best.filter(|(_, inliers, _)| inliers.len() >= E::MIN_SAMPLES)
            .map(|(model, inliers, _)| (model, inliers))
    }
}
