// SPDX-License-Identifier: MIT OR Apache-2.0

//! Random assignment of edit targets.

use std::collections::BTreeSet;

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::data::Sample;

/// How edit targets are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingPolicy {
    /// Draw from targets not yet assigned while any remain, then from all
    /// valid targets.
    PreferUnused,
    /// Draw every target independently from all valid targets.
    WithReplacement,
}

/// Assign each sample a random target with a different subject *and* a
/// different object.
///
/// The result is aligned with `samples`; `None` marks a sample with no
/// valid target. Draws depend only on `rng`'s state and the sample order.
///
/// ```
/// use candle_lre::data::Sample;
/// use candle_lre::eval::{PairingPolicy, random_edit_targets};
/// use rand::SeedableRng;
///
/// let samples = vec![Sample::new("France", "Paris"), Sample::new("Peru", "Lima")];
/// let mut rng = rand::rngs::StdRng::seed_from_u64(0);
/// let targets = random_edit_targets(&samples, PairingPolicy::PreferUnused, &mut rng);
/// assert_eq!(targets[0].as_ref(), Some(&samples[1]));
/// assert_eq!(targets[1].as_ref(), Some(&samples[0]));
/// ```
pub fn random_edit_targets<R: Rng + ?Sized>(
    samples: &[Sample],
    policy: PairingPolicy,
    rng: &mut R,
) -> Vec<Option<Sample>> {
    let mut used: BTreeSet<usize> = BTreeSet::new();
    samples
        .iter()
        .map(|source| {
            let candidates: Vec<usize> = samples
                .iter()
                .enumerate()
                .filter(|(_, t)| t.subject != source.subject && t.object != source.object)
                .map(|(i, _)| i)
                .collect();

            let pool: Vec<usize> = match policy {
                PairingPolicy::PreferUnused => {
                    let unused: Vec<usize> = candidates
                        .iter()
                        .copied()
                        .filter(|i| !used.contains(i))
                        .collect();
                    if unused.is_empty() { candidates } else { unused }
                }
                PairingPolicy::WithReplacement => candidates,
            };

            let chosen = pool.choose(&mut *rng).copied()?;
            used.insert(chosen);
            samples.get(chosen).cloned()
        })
        .collect()
}
