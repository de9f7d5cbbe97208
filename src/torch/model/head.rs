use rand::Rng;
use tch::Tensor;
use tracing::debug;

use super::{BiMamba, ClsTokens};
use crate::config::{ClsTokenPolicy, PoolType};

/// Token indices of the inserted class tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClsPositions {
    Single(i64),
    /// Head and tail tokens of the double policy.
    Pair(i64, i64),
}

impl BiMamba {
    pub(super) fn insert_cls_tokens(
        &self,
        xs: &Tensor,
        random_position: bool,
    ) -> (Tensor, Option<ClsPositions>) {
        let size = xs.size();
        let (batch, m) = (size[0], size[1]);

        match &self.cls {
            ClsTokens::None => (xs.shallow_clone(), None),
            ClsTokens::Double { head, tail } => {
                let x = Tensor::cat(
                    &[
                        head.expand([batch, -1, -1], false),
                        xs.shallow_clone(),
                        tail.expand([batch, -1, -1], false),
                    ],
                    1,
                );
                (x, Some(ClsPositions::Pair(0, m + 1)))
            }
            ClsTokens::Single(token) => {
                let pos = match self.cfg.cls_token {
                    ClsTokenPolicy::Middle => m / 2,
                    _ if random_position => {
                        let pos = self.rng.borrow_mut().gen_range(0..=m);
                        debug!(token_position = pos, "random class token position");
                        pos
                    }
                    ClsTokenPolicy::Tail => m,
                    _ => 0,
                };
                let x = Tensor::cat(
                    &[
                        xs.narrow(1, 0, pos),
                        token.expand([batch, -1, -1], false),
                        xs.narrow(1, pos, m - pos),
                    ],
                    1,
                );
                (x, Some(ClsPositions::Single(pos)))
            }
        }
    }
}

pub(super) fn extract_features(
    hidden: &Tensor,
    positions: Option<ClsPositions>,
    pool: PoolType,
) -> Tensor {
    match positions {
        Some(ClsPositions::Single(pos)) => hidden.select(1, pos),
        Some(ClsPositions::Pair(head, tail)) => (hidden.select(1, head) + hidden.select(1, tail)) / 2.0,
        None => pool_tokens(hidden, pool),
    }
}

/// Pool `[batch, tokens, dim]` hidden states. `max` is deferred to after the
/// head, so it passes the sequence through like `all`.
pub fn pool_tokens(hidden: &Tensor, pool: PoolType) -> Tensor {
    match pool {
        PoolType::None => hidden.select(1, -1),
        PoolType::Mean => hidden.mean_dim(1, false, hidden.kind()),
        PoolType::Max | PoolType::All => hidden.shallow_clone(),
    }
}
