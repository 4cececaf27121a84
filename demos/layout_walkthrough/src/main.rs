//! Layout negotiation walkthrough: conv -> max-pool -> backward chain.
//!
//! Each graph is assembled with the layout the previous one produced as its
//! hint, so only caller-facing conversions remain as reorder steps.
//!
//! Run with: `RUST_LOG=debug cargo run -p layout_walkthrough`

use log::info;
use primnet::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random(len: usize, rng: &mut StdRng) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

fn show(title: &str, graph: &KernelGraph<CpuEngine>) {
    println!("--- {title} ---");
    print!("{graph}");
    println!();
}

fn main() -> Result<()> {
    env_logger::init();
    let mut rng = StdRng::seed_from_u64(7);

    let engine = CpuEngine::default();
    let asm = Assembler::new(engine.clone());

    // Forward: conv (default caller layouts) feeding max-pool.
    let conv = ConvDesc::new((2, 3, 16, 16), (16, 3, 3, 3), (1, 1), (1, 1))?;
    let mut conv_fwd = asm
        .clone()
        .with_config(AssemblyConfig::default().with_name("conv1"))
        .conv_forward(&conv, None, None)?;
    show("conv forward", &conv_fwd);

    let pool = PoolDesc::new(PoolAlgorithm::Max, conv.dst.clone(), (2, 2), (2, 2), (0, 0))?;
    let act_layout = conv_fwd.output_layout().clone();
    let mut pool_fwd = asm.pool_forward(&pool, Some(&act_layout))?;
    show("max-pool forward", &pool_fwd);

    let src = random(conv_fwd.input_size(0).unwrap_or(0), &mut rng);
    let weights = random(conv_fwd.input_size(1).unwrap_or(0), &mut rng);
    let mut act = vec![0.0; conv_fwd.output_size()];
    let profile = conv_fwd.run_profiled(&[&src, &weights], &mut act)?;
    print!("{profile}");

    let mut pooled = vec![0.0; pool_fwd.output_size()];
    pool_fwd.run_pool_fprop(&act, &mut pooled)?;
    info!("pooled {} values into {}", pooled.len(), pool_fwd.output_layout());

    // Backward: pool gradient flows into both convolution gradients.
    let ctx = pool_fwd
        .pooling_context()
        .ok_or_else(|| Error::msg("forward pooling graph kept no context"))?;
    let mut pool_bwd = asm.pool_backward(ctx, None)?;
    show("max-pool backward", &pool_bwd);

    let diff_pooled = random(pool_bwd.input_size(0).unwrap_or(0), &mut rng);
    let mut diff_act = vec![0.0; pool_bwd.output_size()];
    pool_bwd.run_pool_bprop(&diff_pooled, &mut diff_act)?;

    let diff_act_layout = pool_bwd.output_layout().clone();
    let weights_layout = conv_fwd
        .caller_layout(OperandRole::Weights)
        .cloned()
        .ok_or_else(|| Error::msg("conv graph has no weights operand"))?;
    let caller_src_layout = conv_fwd
        .caller_layout(OperandRole::Src)
        .cloned()
        .ok_or_else(|| Error::msg("conv graph has no src operand"))?;
    info!("activation layout {act_layout}, gradient layout {diff_act_layout}");

    let mut bwd_data =
        asm.conv_backward_data(&conv, Some(&diff_act_layout), Some(&weights_layout))?;
    show("conv backward data", &bwd_data);
    let mut diff_src = vec![0.0; bwd_data.output_size()];
    bwd_data.run_conv_bprop_data(&diff_act, &weights, &mut diff_src)?;

    let mut bwd_weights = asm.conv_backward_weights(
        &conv,
        Some(&diff_act_layout),
        Some(&caller_src_layout),
        Some(&weights_layout),
    )?;
    show("conv backward weights", &bwd_weights);
    let mut diff_weights = vec![0.0; bwd_weights.output_size()];
    bwd_weights.run_conv_bprop_weights(&diff_act, &mut diff_weights, &src)?;

    let norm: f32 = diff_weights.iter().map(|v| v * v).sum::<f32>().sqrt();
    println!("|diff_weights| = {norm:.4}");

    let stats = engine.stats();
    println!(
        "engine: {} descriptors, {} primitives created, {} executions",
        stats.descs_created, stats.primitives_created, stats.executions
    );
    Ok(())
}
