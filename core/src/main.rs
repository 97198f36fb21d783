//! CLI entry point for aoti-container.

use anyhow::{bail, Context, Result};
use ndarray::ArrayD;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use aoti_container::cli::{Cli, Commands};
use aoti_container::config::Config;
use aoti_container::reference::AffineGraph;
use aoti_container::{HostTensor, ModelContainer, ProxyCall, ProxyError, Tensor, TensorMut};

/// Proxy executor used when the config enables the delegated operator.
/// Leaves its tensor arguments unchanged.
fn passthrough(call: &mut ProxyCall<'_, '_>) -> std::result::Result<(), ProxyError> {
    debug!(
        node = call.extern_node_index,
        ints = ?call.int_args,
        tensors = call.tensor_args.len(),
        "delegated operator"
    );
    Ok(())
}

fn load_container(config: Option<PathBuf>) -> Result<ModelContainer<AffineGraph>> {
    let config = if let Some(config_path) = config {
        Config::from_yaml_file(&config_path)
            .with_context(|| format!("Failed to load config: {}", config_path.display()))?
    } else {
        Config::default()
    };

    info!("Loading model '{}' on device: {}", config.model.name, config.container.device);
    let graph = AffineGraph::from_config(&config.model)?;
    let container = ModelContainer::from_config(graph, &config.container)?;
    info!("Container ready with {} instances", container.num_models());
    Ok(container)
}

/// Output slots sized at each declared maximum shape.
fn output_slots(container: &ModelContainer<AffineGraph>) -> Vec<HostTensor> {
    container
        .signature()
        .outputs
        .iter()
        .map(|sig| HostTensor::zeros(sig.dtype, sig.max_shape.dims()))
        .collect()
}

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .init();

    match cli.command {
        Commands::Info { config } => {
            let container = load_container(config)?;
            let output = serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "num_models": container.num_models(),
                "is_cpu": container.is_cpu(),
                "cubin_dir": container.cubin_dir(),
                "signature": container.signature(),
                "stats": container.stats(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }

        Commands::Run {
            config,
            input,
            format,
        } => {
            let container = load_container(config)?;

            // Load input data
            info!("Loading input: {}", input.display());
            let input_json: Value = serde_json::from_str(
                &fs::read_to_string(&input)
                    .with_context(|| format!("Failed to read input: {}", input.display()))?,
            )?;

            // Expected format: { "data": [...], "shape": [...] }
            let data: Vec<f32> = input_json["data"]
                .as_array()
                .context("Input must have 'data' array")?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();

            let shape: Vec<usize> = input_json["shape"]
                .as_array()
                .context("Input must have 'shape' array")?
                .iter()
                .map(|v| v.as_u64().unwrap_or(1) as usize)
                .collect();

            let input_array = ArrayD::from_shape_vec(ndarray::IxDyn(&shape), data)
                .context("Failed to create input tensor")?;
            let input_tensor = HostTensor::from_array(&input_array);

            let mut slots = output_slots(&container);
            let mut slot_refs: Vec<&mut dyn TensorMut> =
                slots.iter_mut().map(|s| s as &mut dyn TensorMut).collect();

            info!("Running inference...");
            let start = Instant::now();
            let shapes = container.run(&[&input_tensor], &mut slot_refs, None, Some(&passthrough))?;
            let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
            info!(
                "Inference complete: {} outputs in {:.2}ms",
                shapes.len(),
                latency_ms
            );

            let outputs = slots
                .iter()
                .zip(&shapes)
                .enumerate()
                .map(|(i, (slot, shape))| -> Result<Value> {
                    Ok(serde_json::json!({
                        "index": i,
                        "name": container.output_name(i)?,
                        "shape": shape,
                        "data": slot.to_f32_vec(shape)?,
                    }))
                })
                .collect::<Result<Vec<_>>>()?;

            let output = serde_json::json!({
                "num_outputs": shapes.len(),
                "latency_ms": latency_ms,
                "outputs": outputs,
            });

            if format == "pretty" {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("{}", serde_json::to_string(&output)?);
            }
        }

        Commands::Check {
            config,
            threads,
            iterations,
        } => {
            let container = load_container(config)?;
            let max_shape = container.max_input_shape(0)?.clone();
            let ramp: Vec<f32> = (0..max_shape.numel()).map(|i| i as f32 * 0.25).collect();
            let input = HostTensor::from_f32(max_shape.dims(), &ramp)?;

            let mut baseline = output_slots(&container);
            {
                let mut refs: Vec<&mut dyn TensorMut> =
                    baseline.iter_mut().map(|s| s as &mut dyn TensorMut).collect();
                container.run(&[&input], &mut refs, None, Some(&passthrough))?;
            }

            println!(
                "Checking {} threads x {} runs on {} instances",
                threads,
                iterations,
                container.num_models()
            );
            let start = Instant::now();
            let mismatches: usize = std::thread::scope(|scope| -> Result<usize> {
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        scope.spawn(|| -> Result<usize> {
                            let mut mismatches = 0;
                            for _ in 0..iterations {
                                let mut slots = output_slots(&container);
                                let mut refs: Vec<&mut dyn TensorMut> =
                                    slots.iter_mut().map(|s| s as &mut dyn TensorMut).collect();
                                container.run(&[&input], &mut refs, None, Some(&passthrough))?;
                                drop(refs);
                                let same = slots
                                    .iter()
                                    .zip(&baseline)
                                    .all(|(a, b)| a.as_bytes() == b.as_bytes());
                                if !same {
                                    mismatches += 1;
                                }
                            }
                            Ok(mismatches)
                        })
                    })
                    .collect();
                let mut total = 0;
                for handle in handles {
                    match handle.join() {
                        Ok(result) => total += result?,
                        Err(_) => bail!("check thread panicked"),
                    }
                }
                Ok(total)
            })?;

            let stats = container.stats();
            println!("Elapsed: {:.2}ms", start.elapsed().as_secs_f64() * 1000.0);
            println!("{}", serde_json::to_string_pretty(&stats)?);
            if mismatches > 0 {
                bail!("{} runs produced output different from the baseline", mismatches);
            }
            println!("Status: OK (all outputs bit-identical)");
        }
    }

    Ok(())
}
