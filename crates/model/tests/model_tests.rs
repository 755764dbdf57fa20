use anyhow::Result;
use candle_core::{Device, Tensor};
use lai_model::{AgnosticConfig, AgnosticModel, LaiModel, ReferencePanel};

fn build_config(seq_len: usize, window_size: usize) -> AgnosticConfig {
    AgnosticConfig {
        n_classes: 2,
        seq_len,
        window_size,
        smoother_kernel: 3,
        seed: 7,
        device: Device::Cpu,
    }
}

/// Query equals reference 1 (ancestry 1); reference 0 (ancestry 0) is its complement.
fn matching_panel(seq_len: usize) -> Result<(Tensor, Tensor, Tensor)> {
    let query: Vec<f32> = (0..seq_len)
        .map(|i| if i % 3 == 0 { 1.0 } else { -1.0 })
        .collect();
    let complement: Vec<f32> = query.iter().map(|v| -v).collect();
    let mixed = Tensor::from_vec(query.clone(), (1, seq_len), &Device::Cpu)?;
    let mut panel = complement;
    panel.extend_from_slice(&query);
    let haplotypes = Tensor::from_vec(panel, (1, 2, seq_len), &Device::Cpu)?;
    let labels = Tensor::from_vec(vec![0u32, 1], (1, 2), &Device::Cpu)?;
    Ok((mixed, haplotypes, labels))
}

#[test]
fn forward_produces_expected_shapes() -> Result<()> {
    let model = AgnosticModel::new(build_config(10, 4))?;
    let mixed = Tensor::ones((3, 10), candle_core::DType::F32, &Device::Cpu)?;
    let haplotypes = Tensor::ones((3, 5, 10), candle_core::DType::F32, &Device::Cpu)?;
    let labels = Tensor::from_vec(vec![0u32, 1, 0, 1, 1].repeat(3), (3, 5), &Device::Cpu)?;

    let output = model.forward(
        &mixed,
        &ReferencePanel {
            haplotypes: &haplotypes,
            labels: &labels,
        },
    )?;

    assert_eq!(output.predictions.dims(), &[3, 10, 2]);
    assert_eq!(output.out_smoother.dims(), &[3, 2, 3]);
    assert_eq!(output.out_base.dims(), &[3, 2, 3]);
    assert_eq!(output.max_indices.dims(), &[3, 3]);
    let max_indices = output.max_indices.to_vec2::<u32>()?;
    assert!(max_indices.iter().flatten().all(|&idx| idx < 5));
    Ok(())
}

#[test]
fn attends_to_identical_reference() -> Result<()> {
    let model = AgnosticModel::new(build_config(12, 4))?;
    let (mixed, haplotypes, labels) = matching_panel(12)?;

    let output = model.forward(
        &mixed,
        &ReferencePanel {
            haplotypes: &haplotypes,
            labels: &labels,
        },
    )?;

    let max_indices = output.max_indices.to_vec2::<u32>()?;
    assert_eq!(max_indices, vec![vec![1, 1, 1]]);

    let base = output.out_base.to_vec3::<f32>()?;
    for window in 0..3 {
        assert!(base[0][1][window] > base[0][0][window]);
    }
    Ok(())
}

#[test]
fn gradients_reach_every_parameter() -> Result<()> {
    let model = AgnosticModel::new(build_config(8, 4))?;
    let (mixed, haplotypes, labels) = matching_panel(8)?;

    let output = model.forward(
        &mixed,
        &ReferencePanel {
            haplotypes: &haplotypes,
            labels: &labels,
        },
    )?;
    let grads = output.predictions.sqr()?.sum_all()?.backward()?;

    for (name, var) in model.parameters() {
        assert!(grads.get(var.as_tensor()).is_some(), "no gradient for {name}");
    }
    Ok(())
}

#[test]
fn gradients_flow_through_a_single_window() -> Result<()> {
    let model = AgnosticModel::new(build_config(8, 8))?;
    let (mixed, haplotypes, labels) = matching_panel(8)?;

    let output = model.forward(
        &mixed,
        &ReferencePanel {
            haplotypes: &haplotypes,
            labels: &labels,
        },
    )?;
    assert_eq!(output.out_smoother.dims(), &[1, 2, 1]);
    let grads = output.predictions.sqr()?.sum_all()?.backward()?;

    for (name, var) in model.parameters() {
        let grad = grads
            .get(var.as_tensor())
            .ok_or_else(|| anyhow::anyhow!("no gradient for {name}"))?;
        assert_eq!(grad.dims(), var.as_tensor().dims());
    }
    Ok(())
}

#[test]
fn rejects_even_smoother_kernel() {
    let mut config = build_config(8, 4);
    config.smoother_kernel = 2;
    assert!(AgnosticModel::new(config).is_err());
}

#[test]
fn training_flag_toggles() -> Result<()> {
    let model = AgnosticModel::new(build_config(8, 4))?;
    assert!(model.is_training());
    model.set_training(false);
    assert!(!model.is_training());
    Ok(())
}
