use tch::{nn, Device, Kind, Tensor};

use wifi_bimamba::config::{ClsTokenPolicy, PoolType, ScanVariant};
use wifi_bimamba::torch::model::ClsPositions;
use wifi_bimamba::torch::ssm::InferenceCache;
use wifi_bimamba::{BiMamba, BiMambaConfig, ForwardOptions};

const TOKENS: i64 = 7;
const DIM: i64 = 16;

fn config() -> BiMambaConfig {
    BiMambaConfig {
        depth: 2,
        embed_dim: DIM,
        num_tokens: TOKENS,
        num_classes: 4,
        ..Default::default()
    }
}

fn build(cfg: &BiMambaConfig) -> (nn::VarStore, BiMamba) {
    tch::manual_seed(3);
    let vs = nn::VarStore::new(Device::Cpu);
    let model = BiMamba::new(&vs.root(), cfg).unwrap();
    (vs, model)
}

fn tokens(batch: i64) -> Tensor {
    Tensor::randn([batch, TOKENS, DIM], (Kind::Float, Device::Cpu))
}

fn max_diff(a: &Tensor, b: &Tensor) -> f64 {
    (a - b).abs().max().double_value(&[])
}

fn features() -> ForwardOptions {
    ForwardOptions {
        return_features: true,
        ..Default::default()
    }
}

#[test]
fn cls_features_are_one_vector_per_sample() {
    for policy in [
        ClsTokenPolicy::Head,
        ClsTokenPolicy::Tail,
        ClsTokenPolicy::Middle,
        ClsTokenPolicy::Double,
    ] {
        for pool in [PoolType::None, PoolType::Mean, PoolType::Max, PoolType::All] {
            let (_vs, model) = build(&BiMambaConfig {
                cls_token: policy,
                pool,
                ..config()
            });
            let f = model.forward(&tokens(3), features(), None);
            assert_eq!(f.size(), vec![3, DIM], "{policy:?} / {pool}");

            let logits = model.forward(&tokens(3), ForwardOptions::default(), None);
            assert_eq!(logits.size(), vec![3, 4], "{policy:?} / {pool}");
        }
    }
}

#[test]
fn eval_forward_is_repeatable() {
    let (_vs, model) = build(&BiMambaConfig {
        cls_token: ClsTokenPolicy::Head,
        abs_pos_embed: true,
        drop_rate: 0.5,
        drop_path_rate: 0.5,
        ..config()
    });
    let x = tokens(2);
    let (a, b) = tch::no_grad(|| {
        (
            model.forward(&x, ForwardOptions::default(), None),
            model.forward(&x, ForwardOptions::default(), None),
        )
    });
    assert!(a.equal(&b));
}

#[test]
fn mean_pool_averages_final_hidden_states() {
    let (_vs, model) = build(&BiMambaConfig {
        pool: PoolType::Mean,
        ..config()
    });
    let x = tokens(2);
    let (hidden, positions) = model.forward_hidden(&x, ForwardOptions::default(), None);
    assert!(positions.is_none());
    let f = model.forward(&x, features(), None);
    assert!(max_diff(&f, &hidden.mean_dim(1, false, Kind::Float)) < 1e-6);
}

#[test]
fn no_pool_takes_last_hidden_state() {
    let (_vs, model) = build(&config());
    let x = tokens(2);
    let (hidden, _) = model.forward_hidden(&x, ForwardOptions::default(), None);
    let f = model.forward(&x, features(), None);
    assert!(f.equal(&hidden.select(1, TOKENS - 1)));
}

#[test]
fn max_pool_reduces_logits_over_tokens() {
    let (vs, model) = build(&BiMambaConfig {
        pool: PoolType::Max,
        ..config()
    });
    let x = tokens(2);
    let seq = model.forward(&x, features(), None);
    assert_eq!(seq.size(), vec![2, TOKENS, DIM]);

    let vars = vs.variables();
    let per_token = seq.linear(&vars["head.weight"], Some(&vars["head.bias"]));
    let logits = model.forward(&x, ForwardOptions::default(), None);
    assert!(max_diff(&logits, &per_token.amax([1], false)) < 1e-6);
}

#[test]
fn double_cls_averages_head_and_tail() {
    let (_vs, model) = build(&BiMambaConfig {
        cls_token: ClsTokenPolicy::Double,
        abs_pos_embed: true,
        ..config()
    });
    let x = tokens(2);
    let (hidden, positions) = model.forward_hidden(&x, ForwardOptions::default(), None);
    assert_eq!(hidden.size(), vec![2, TOKENS + 2, DIM]);
    assert_eq!(positions, Some(ClsPositions::Pair(0, TOKENS + 1)));

    let head = hidden.select(1, 0);
    let tail = hidden.select(1, TOKENS + 1);
    assert_eq!(head.size(), vec![2, DIM]);
    let f = model.forward(&x, features(), None);
    assert!(max_diff(&f, &((head + tail) / 2.0)) < 1e-6);
}

#[test]
fn flipped_runs_return_original_token_order() {
    // Causal single-direction stack: token t only sees tokens <= t unless
    // the sequence is scanned reversed.
    let cfg = BiMambaConfig {
        bidirectional: false,
        scan: ScanVariant::None,
        flip_sequence_ratio: 1.0,
        ..config()
    };
    let (_vs, flipped) = build(&cfg);
    let (_vs_ref, reference) = build(&BiMambaConfig {
        flip_sequence_ratio: -1.0,
        ..cfg.clone()
    });

    let x = tokens(2);
    let bump = Tensor::zeros_like(&x);
    let _ = bump.narrow(1, TOKENS - 1, 1).fill_(1.0);
    let x_bumped = &x + bump;

    let run = |model: &BiMamba, xs: &Tensor| model.forward_hidden(xs, ForwardOptions::default(), None).0;
    let (h_flip, h_flip_bumped) = (run(&flipped, &x), run(&flipped, &x_bumped));
    let (h_ref, h_ref_bumped) = (run(&reference, &x), run(&reference, &x_bumped));

    assert_eq!(h_flip.size(), vec![2, TOKENS, DIM]);
    assert!(max_diff(&h_flip, &h_ref) > 1e-4);

    // Unflipped: changing the last token leaves the first untouched.
    assert!(max_diff(&h_ref.select(1, 0), &h_ref_bumped.select(1, 0)) < 1e-6);
    // Flipped: the first original token was scanned last, so it moves, and
    // it is still reported at index 0.
    assert!(max_diff(&h_flip.select(1, 0), &h_flip_bumped.select(1, 0)) > 1e-4);

    // Pool `none` reads the last token in original order.
    let f = flipped.forward(&x, features(), None);
    assert!(max_diff(&f, &h_flip.select(1, TOKENS - 1)) < 1e-6);
    assert!(max_diff(&f, &h_flip.select(1, 0)) > 1e-4);
}

#[test]
fn cache_records_every_layer() {
    let (_vs, model) = build(&BiMambaConfig {
        depth: 4,
        scan: ScanVariant::V2,
        ..config()
    });
    let mut cache = InferenceCache::new();
    let _ = tch::no_grad(|| model.forward(&tokens(1), ForwardOptions::default(), Some(&mut cache)));
    assert_eq!(cache.len(), 4);
    for layer in 0..4 {
        assert!(cache.state(layer).is_some());
    }
    assert_eq!(cache.seqlen_offset, TOKENS);

    let _ = tch::no_grad(|| model.forward(&tokens(1), ForwardOptions::default(), Some(&mut cache)));
    assert_eq!(cache.seqlen_offset, 2 * TOKENS);
    cache.reset();
    assert_eq!(cache.seqlen_offset, 0);
}

#[test]
fn cache_offset_counts_class_tokens() {
    let (_vs, model) = build(&BiMambaConfig {
        cls_token: ClsTokenPolicy::Double,
        ..config()
    });
    let mut cache = InferenceCache::new();
    let _ = tch::no_grad(|| model.forward(&tokens(1), ForwardOptions::default(), Some(&mut cache)));
    assert_eq!(cache.seqlen_offset, TOKENS + 2);
}
