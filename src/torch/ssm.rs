//! Mamba selective state space mixer
//!
//! Reference implementation of the selective scan in plain tensor ops:
//! - Input projection into x and gate z
//! - Causal depthwise conv + SiLU on x
//! - Input-dependent dt, B, C from x
//! - Recurrence h_t = exp(dt A) h_{t-1} + dt B x_t, y_t = C h_t + D x_t
//! - Optional backward scan over the flipped sequence (bidirectional variants)

use hashbrown::HashMap;
use tch::nn::Init;
use tch::{nn, Kind, Tensor};

use crate::config::{DtInit, ScanVariant, SsmConfig};
use crate::error::{ModelError, ModelResult};

/// Discretize and scan.
///
/// `u`, `delta`: `[batch, seqlen, d_inner]`; `a`: `[d_inner, d_state]`;
/// `b`, `c`: `[batch, seqlen, d_state]`; `d`: `[d_inner]`.
/// Returns `y` `[batch, seqlen, d_inner]` in `u`'s kind and the final state
/// `[batch, d_inner, d_state]` in f32.
pub fn selective_scan(
    u: &Tensor,
    delta: &Tensor,
    a: &Tensor,
    b: &Tensor,
    c: &Tensor,
    d: &Tensor,
    initial_state: Option<&Tensor>,
) -> (Tensor, Tensor) {
    let size = u.size();
    let (batch, seqlen, d_inner) = (size[0], size[1], size[2]);
    let d_state = a.size()[1];

    let u_f = u.to_kind(Kind::Float);
    let delta = delta.to_kind(Kind::Float);
    let b = b.to_kind(Kind::Float);
    let c = c.to_kind(Kind::Float);

    // [batch, seqlen, d_inner, d_state]
    let delta_a = (delta.unsqueeze(-1) * a.to_kind(Kind::Float)).exp();
    let delta_b_u = (&delta * &u_f).unsqueeze(-1) * b.unsqueeze(2);

    let mut h = match initial_state {
        Some(s) => s.to_kind(Kind::Float),
        None => Tensor::zeros([batch, d_inner, d_state], (Kind::Float, u.device())),
    };
    let mut ys = Vec::with_capacity(seqlen as usize);
    for t in 0..seqlen {
        h = delta_a.select(1, t) * &h + delta_b_u.select(1, t);
        let c_t = c.select(1, t).unsqueeze(1);
        ys.push((&h * c_t).sum_dim_intlist(-1, false, Kind::Float));
    }
    let y = Tensor::stack(&ys, 1) + &u_f * d.to_kind(Kind::Float);
    (y.to_kind(u.kind()), h)
}

/// Recurrent state of one mixer after a forward pass.
#[derive(Debug)]
pub struct MambaState {
    /// Last `d_conv` pre-conv inputs: `[batch, d_inner, d_conv]`
    pub conv_state: Tensor,
    /// `[batch, d_inner, d_state]`
    pub ssm_state: Tensor,
}

impl MambaState {
    pub fn reset(&mut self) {
        let _ = self.conv_state.zero_();
        let _ = self.ssm_state.zero_();
    }
}

/// Per-call cache of mixer states keyed by layer index.
#[derive(Debug, Default)]
pub struct InferenceCache {
    /// Tokens run through the model since the last reset.
    pub seqlen_offset: i64,
    states: HashMap<usize, MambaState>,
}

impl InferenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, layer_idx: usize) -> Option<&MambaState> {
        self.states.get(&layer_idx)
    }

    pub fn state_mut(&mut self, layer_idx: usize) -> Option<&mut MambaState> {
        self.states.get_mut(&layer_idx)
    }

    pub fn insert(&mut self, layer_idx: usize, state: MambaState) {
        self.states.insert(layer_idx, state);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn reset(&mut self) {
        self.seqlen_offset = 0;
        for state in self.states.values_mut() {
            state.reset();
        }
    }
}

/// Conv + projections + scan parameters for one scan direction.
#[derive(Debug)]
struct ScanBranch {
    conv1d: nn::Conv1D,
    x_proj: nn::Linear,
    dt_proj: nn::Linear,
    a_log: Tensor,
    d_param: Tensor,
}

impl ScanBranch {
    fn new(p: &nn::Path, d_model: i64, cfg: &SsmConfig, suffix: &str) -> Self {
        let d_inner = cfg.d_inner(d_model);
        let dt_rank = cfg.dt_rank(d_model);
        let d_state = cfg.d_state;

        let conv1d = nn::conv1d(
            p / format!("conv1d{suffix}"),
            d_inner,
            d_inner,
            cfg.d_conv,
            nn::ConvConfig {
                padding: cfg.d_conv - 1,
                groups: d_inner,
                bias: cfg.conv_bias,
                ..Default::default()
            },
        );
        let x_proj = nn::linear(
            p / format!("x_proj{suffix}"),
            d_inner,
            dt_rank + 2 * d_state,
            nn::LinearConfig {
                bias: false,
                ..Default::default()
            },
        );

        // dt_proj: weight ~ U(-std, std) or const, bias = softplus^-1(dt)
        let dt_p = p / format!("dt_proj{suffix}");
        let dt_init_std = (dt_rank as f64).powf(-0.5) * cfg.dt_scale;
        let ws_init = match cfg.dt_init {
            DtInit::Constant => Init::Const(dt_init_std),
            DtInit::Random => Init::Uniform {
                lo: -dt_init_std,
                up: dt_init_std,
            },
        };
        let ws = dt_p.var("weight", &[d_inner, dt_rank], ws_init);
        let dt = Tensor::empty([d_inner], (Kind::Float, p.device()))
            .uniform_(cfg.dt_min.ln(), cfg.dt_max.ln())
            .exp()
            .clamp(cfg.dt_init_floor, f64::INFINITY);
        // Inverse softplus: x = dt + log(-expm1(-dt))
        let inv_dt = &dt + (-&dt).expm1().neg().log();
        let bs = dt_p.var_copy("bias", &inv_dt);
        let dt_proj = nn::Linear { ws, bs: Some(bs) };

        // S4D real init: A = -[1..=d_state] per channel
        let a_init = Tensor::arange_start(1, d_state + 1, (Kind::Float, p.device()))
            .repeat([d_inner, 1])
            .log();
        let a_log = p.var_copy(&format!("A{suffix}_log"), &a_init);
        let d_param = p.var(&format!("D{suffix}"), &[d_inner], Init::Const(1.0));

        Self {
            conv1d,
            x_proj,
            dt_proj,
            a_log,
            d_param,
        }
    }
}

/// Mamba mixer, `[batch, seqlen, d_model] -> [batch, seqlen, d_model]`.
#[derive(Debug)]
pub struct MambaMixer {
    layer_idx: usize,
    scan: ScanVariant,
    divide_out: bool,
    d_inner: i64,
    d_state: i64,
    d_conv: i64,
    dt_rank: i64,
    in_proj: nn::Linear,
    forward_branch: ScanBranch,
    /// V1: separate A only; the rest is shared with the forward branch.
    a_b_log: Option<Tensor>,
    /// V2: fully separate backward branch.
    backward_branch: Option<ScanBranch>,
    out_proj: nn::Linear,
    gamma: Option<Tensor>,
}

impl MambaMixer {
    pub fn new(
        p: &nn::Path,
        d_model: i64,
        layer_idx: usize,
        cfg: &SsmConfig,
        scan: ScanVariant,
        divide_out: bool,
        init_layer_scale: Option<f64>,
    ) -> Self {
        let d_inner = cfg.d_inner(d_model);
        let linear_cfg = nn::LinearConfig {
            bias: cfg.bias,
            ..Default::default()
        };
        let in_proj = nn::linear(p / "in_proj", d_model, 2 * d_inner, linear_cfg);
        let forward_branch = ScanBranch::new(p, d_model, cfg, "");

        let (a_b_log, backward_branch) = match scan {
            ScanVariant::None => (None, None),
            ScanVariant::V1 => {
                let a_init = Tensor::arange_start(1, cfg.d_state + 1, (Kind::Float, p.device()))
                    .repeat([d_inner, 1])
                    .log();
                (Some(p.var_copy("A_b_log", &a_init)), None)
            }
            ScanVariant::V2 => (None, Some(ScanBranch::new(p, d_model, cfg, "_b"))),
        };

        let out_proj = nn::linear(p / "out_proj", d_inner, d_model, linear_cfg);
        let gamma = init_layer_scale.map(|s| p.var("gamma", &[d_model], Init::Const(s)));

        Self {
            layer_idx,
            scan,
            divide_out,
            d_inner,
            d_state: cfg.d_state,
            d_conv: cfg.d_conv,
            dt_rank: cfg.dt_rank(d_model),
            in_proj,
            forward_branch,
            a_b_log,
            backward_branch,
            out_proj,
            gamma,
        }
    }

    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    pub fn scan(&self) -> ScanVariant {
        self.scan
    }

    pub fn forward(&self, u: &Tensor, cache: Option<&mut InferenceCache>) -> Tensor {
        let xz = u.apply(&self.in_proj);
        let x = xz.narrow(-1, 0, self.d_inner);
        let z = xz.narrow(-1, self.d_inner, self.d_inner);

        let (y_fwd, final_state) = self.branch(&x, &z, &self.forward_branch, &self.forward_branch.a_log);
        if let Some(cache) = cache {
            cache.insert(
                self.layer_idx,
                MambaState {
                    conv_state: self.conv_window(&x),
                    ssm_state: final_state,
                },
            );
        }

        let y = match (&self.a_b_log, &self.backward_branch) {
            (Some(a_b_log), _) => {
                let (y_b, _) = self.branch(&x.flip([1]), &z.flip([1]), &self.forward_branch, a_b_log);
                self.combine(y_fwd, y_b)
            }
            (None, Some(branch)) => {
                let (y_b, _) = self.branch(&x.flip([1]), &z.flip([1]), branch, &branch.a_log);
                self.combine(y_fwd, y_b)
            }
            (None, None) => y_fwd,
        };

        let out = y.apply(&self.out_proj);
        match &self.gamma {
            Some(gamma) => out * gamma,
            None => out,
        }
    }

    /// Single-token recurrence `[batch, d_model] -> [batch, d_model]`, updating
    /// `state` in place. Only defined for the forward-only scan.
    pub fn step(&self, u: &Tensor, state: &mut MambaState) -> ModelResult<Tensor> {
        if self.scan != ScanVariant::None {
            return Err(ModelError::StreamingUnsupported { scan: self.scan });
        }
        let branch = &self.forward_branch;
        let xz = u.apply(&self.in_proj);
        let x = xz.narrow(-1, 0, self.d_inner);
        let z = xz.narrow(-1, self.d_inner, self.d_inner);

        // Shift conv window left and append x
        let rolled = Tensor::cat(
            &[
                state.conv_state.narrow(2, 1, self.d_conv - 1),
                x.unsqueeze(-1).to_kind(state.conv_state.kind()),
            ],
            2,
        );
        state.conv_state.copy_(&rolled);

        let conv_weight = branch.conv1d.ws.squeeze_dim(1);
        let x_conv = (&state.conv_state * &conv_weight).sum_dim_intlist(-1, false, Kind::Float);
        let x_conv = match &branch.conv1d.bs {
            Some(bias) => (x_conv + bias).silu(),
            None => x_conv.silu(),
        };

        let x_dbl = x_conv.apply(&branch.x_proj);
        let dt = x_dbl.narrow(-1, 0, self.dt_rank);
        let b = x_dbl.narrow(-1, self.dt_rank, self.d_state);
        let c = x_dbl.narrow(-1, self.dt_rank + self.d_state, self.d_state);
        let delta = dt.apply(&branch.dt_proj).softplus();

        let a = branch.a_log.to_kind(Kind::Float).exp().neg();
        let da = (delta.unsqueeze(-1) * a).exp();
        let dbu = (&delta * &x_conv).unsqueeze(-1) * b.unsqueeze(1);
        let h = da * &state.ssm_state + dbu;
        state.ssm_state.copy_(&h);

        let y = (h * c.unsqueeze(1)).sum_dim_intlist(-1, false, Kind::Float)
            + &x_conv * &branch.d_param;
        let y = (y * z.to_kind(Kind::Float).silu()).to_kind(u.kind());
        let out = y.apply(&self.out_proj);
        Ok(match &self.gamma {
            Some(gamma) => out * gamma,
            None => out,
        })
    }

    pub fn init_state(&self, batch_size: i64, device: tch::Device) -> MambaState {
        MambaState {
            conv_state: Tensor::zeros([batch_size, self.d_inner, self.d_conv], (Kind::Float, device)),
            ssm_state: Tensor::zeros([batch_size, self.d_inner, self.d_state], (Kind::Float, device)),
        }
    }

    /// Gated scan output `[batch, seqlen, d_inner]` and the final SSM state.
    fn branch(&self, x: &Tensor, z: &Tensor, branch: &ScanBranch, a_log: &Tensor) -> (Tensor, Tensor) {
        let seqlen = x.size()[1];

        // Causal conv1d
        let x_conv = x
            .transpose(1, 2)
            .apply(&branch.conv1d)
            .narrow(2, 0, seqlen)
            .transpose(1, 2)
            .silu();

        let x_dbl = x_conv.apply(&branch.x_proj);
        let dt = x_dbl.narrow(-1, 0, self.dt_rank);
        let b = x_dbl.narrow(-1, self.dt_rank, self.d_state);
        let c = x_dbl.narrow(-1, self.dt_rank + self.d_state, self.d_state);
        let delta = dt.apply(&branch.dt_proj).softplus();

        let a = a_log.to_kind(Kind::Float).exp().neg();
        let (y, h) = selective_scan(&x_conv, &delta, &a, &b, &c, &branch.d_param, None);
        (y * z.silu(), h)
    }

    fn combine(&self, y_fwd: Tensor, y_bwd: Tensor) -> Tensor {
        let y = y_fwd + y_bwd.flip([1]);
        if self.divide_out {
            y / 2.0
        } else {
            y
        }
    }

    /// Last `d_conv` pre-conv inputs, zero-padded on the left.
    fn conv_window(&self, x: &Tensor) -> Tensor {
        let seqlen = x.size()[1];
        let xt = x.transpose(1, 2).to_kind(Kind::Float);
        if seqlen >= self.d_conv {
            xt.narrow(2, seqlen - self.d_conv, self.d_conv).contiguous()
        } else {
            xt.constant_pad_nd([self.d_conv - seqlen, 0])
        }
    }
}
