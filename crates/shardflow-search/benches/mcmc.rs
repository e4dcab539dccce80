//! Search-driver benchmark: annealing over a small MLP.

use std::sync::atomic::AtomicBool;

use criterion::{criterion_group, criterion_main, Criterion};
use shardflow_core::config::Config;
use shardflow_core::tensor::TensorShape;
use shardflow_core::types::{Activation, CompMode, DataType, GuidAllocator};
use shardflow_ops::{LinearAttrs, OperatorAttrs};
use shardflow_pcg::{lift, LayerGraph, Pcg};
use shardflow_search::{AnalyticCostModel, Assignment, McmcSearcher, SearchConfig};

fn build_mlp() -> (Pcg, Config) {
    let mut guids = GuidAllocator::new();
    let mut layers = LayerGraph::new();
    let mut prev = layers.add_input(&mut guids, TensorShape::new([64, 256], DataType::Float));
    for width in [256, 128, 64, 16] {
        prev = layers
            .add_layer(
                &mut guids,
                OperatorAttrs::Linear(LinearAttrs {
                    out_channels: width,
                    use_bias: true,
                    activation: Activation::Relu,
                }),
                &[prev],
                None,
            )
            .unwrap()[0];
    }
    let mut config = Config::with_machine(2, 2);
    config.only_data_parallel = true;
    let pcg = lift(&layers, &config, &mut guids).unwrap();
    (pcg, config)
}

fn bench_search(c: &mut Criterion) {
    let (pcg, config) = build_mlp();
    let model = AnalyticCostModel::default();

    c.bench_function("mcmc_500_iters", |b| {
        b.iter(|| {
            let initial = Assignment::data_parallel(&pcg, config.total_workers());
            let mut searcher = McmcSearcher::new(
                &config,
                SearchConfig {
                    budget: 500,
                    alpha: 1.2,
                    use_propagation: true,
                    seed: 42,
                },
            );
            let stop = AtomicBool::new(false);
            searcher
                .optimize(&pcg, initial, &model, CompMode::Training, &stop)
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_search);
criterion_main!(benches);
