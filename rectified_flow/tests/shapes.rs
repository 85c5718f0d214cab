use ndarray::{Array1, ArrayD, IxDyn};
use rand::{SeedableRng, rngs::StdRng};
use rectified_flow::{DenoiserCore, MlErr, ModelConfig};

fn config(patch: bool, uvit: bool, sample_size: usize) -> ModelConfig {
    ModelConfig {
        channels: 3,
        d_model: 16,
        n_heads: 4,
        n_layers: 3,
        sample_size,
        mlp_ratio: 2,
        patch,
        patch_size: 2,
        uvit,
        t_freq_dim: 16,
    }
}

fn assert_shape_preserved(cfg: ModelConfig) {
    let mut rng = StdRng::seed_from_u64(0);
    let mut core = DenoiserCore::new(&cfg).unwrap();
    let params = core.init_params(&mut rng).unwrap();

    let mut shape = vec![2];
    shape.extend(cfg.sample_shape());
    let x = ArrayD::<f32>::ones(IxDyn(&shape));
    let t = Array1::from(vec![0.1, 0.9]);

    let out = core.forward(&params, x.view(), t.view()).unwrap();
    assert_eq!(out.shape(), x.shape(), "{cfg:?}");
    assert!(out.iter().all(|v| v.is_finite()));
}

#[test]
fn output_shape_matches_input_in_every_configuration() {
    for patch in [true, false] {
        for uvit in [true, false] {
            for sample_size in [4, 8] {
                assert_shape_preserved(config(patch, uvit, sample_size));
            }
        }
    }
}

#[test]
fn mismatched_spatial_size_is_rejected() {
    let cfg = config(true, false, 4);
    let mut core = DenoiserCore::new(&cfg).unwrap();
    let params = vec![0.0; core.num_params()];

    let x = ArrayD::<f32>::zeros(IxDyn(&[1, 3, 8, 8]));
    let res = core.forward(&params, x.view(), Array1::from(vec![0.5]).view());
    assert!(matches!(res, Err(MlErr::SizeMismatch { got: 8, expected: 4, .. })));
}

#[test]
fn mismatched_sequence_length_is_rejected() {
    let cfg = config(false, false, 4);
    let mut core = DenoiserCore::new(&cfg).unwrap();
    let params = vec![0.0; core.num_params()];

    let x = ArrayD::<f32>::zeros(IxDyn(&[1, 5, 3]));
    assert!(core.forward(&params, x.view(), Array1::from(vec![0.5]).view()).is_err());
}

#[test]
fn wrong_parameter_buffer_is_rejected() {
    let cfg = config(false, false, 4);
    let mut core = DenoiserCore::new(&cfg).unwrap();
    let params = vec![0.0; core.num_params() - 1];

    let x = ArrayD::<f32>::zeros(IxDyn(&[1, 4, 3]));
    let res = core.forward(&params, x.view(), Array1::from(vec![0.5]).view());
    assert!(matches!(res, Err(MlErr::SizeMismatch { .. })));
}

#[test]
fn invalid_configs_fail_at_construction() {
    let cfg = ModelConfig {
        d_model: 18,
        ..config(true, false, 4)
    };
    assert!(matches!(DenoiserCore::new(&cfg), Err(MlErr::InvalidConfig(_))));
}

#[test]
fn identical_inputs_give_identical_outputs() {
    let cfg = config(true, true, 4);
    let mut rng = StdRng::seed_from_u64(3);
    let mut core = DenoiserCore::new(&cfg).unwrap();
    let mut params = core.init_params(&mut rng).unwrap();
    params.iter_mut().enumerate().for_each(|(i, p)| *p += (i as f32 * 0.37).sin() * 0.1);

    let x = ArrayD::from_shape_fn(IxDyn(&[2, 3, 4, 4]), |d| (d[1] + d[2] * d[3]) as f32 * 0.1);
    let t = Array1::from(vec![0.25, 0.75]);

    let a = core.forward(&params, x.view(), t.view()).unwrap();
    let b = core.forward(&params, x.view(), t.view()).unwrap();
    assert_eq!(a, b);
}
