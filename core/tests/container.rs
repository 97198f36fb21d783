use anyhow::Result;
use aoti_container::reference::{AffineGraph, AffineScratch};
use aoti_container::{
    CompiledGraph, ContainerError, DType, ErrorClass, HostTensor, InstanceOptions,
    ModelContainer, ModelSignature, ProxyCall, ProxyError, RunContext, Shape,
    Tensor, TensorMut,
};
use approx::assert_abs_diff_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

mod common;
use common::{wait_until, Gate};

/// Affine graph whose instances are counted while alive, and which can be
/// told to fail when binding one particular instance.
struct CountingGraph {
    inner: AffineGraph,
    live: Arc<AtomicUsize>,
    fail_at: Option<usize>,
}

struct CountedScratch {
    inner: AffineScratch,
    live: Arc<AtomicUsize>,
}

impl Drop for CountedScratch {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CompiledGraph for CountingGraph {
    type Scratch = CountedScratch;

    fn signature(&self) -> &ModelSignature {
        self.inner.signature()
    }

    fn instantiate(&self, options: &InstanceOptions<'_>) -> aoti_container::Result<CountedScratch> {
        if self.fail_at == Some(options.index) {
            return Err(ContainerError::init("artifact missing"));
        }
        let inner = self.inner.instantiate(options)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(CountedScratch {
            inner,
            live: Arc::clone(&self.live),
        })
    }

    fn execute(
        &self,
        scratch: &mut CountedScratch,
        inputs: &[&dyn Tensor],
        outputs: &mut [&mut dyn TensorMut],
        ctx: &RunContext<'_>,
    ) -> aoti_container::Result<Vec<Shape>> {
        self.inner.execute(&mut scratch.inner, inputs, outputs, ctx)
    }
}

fn counting(fail_at: Option<usize>) -> (CountingGraph, Arc<AtomicUsize>) {
    let live = Arc::new(AtomicUsize::new(0));
    let graph = CountingGraph {
        inner: AffineGraph::builder().build().unwrap(),
        live: Arc::clone(&live),
        fail_at,
    };
    (graph, live)
}

fn square(scale: f32, extern_op: bool) -> AffineGraph {
    AffineGraph::builder()
        .max_shape(&[4, 4])
        .scale(scale)
        .bias(1.0)
        .extern_op(extern_op)
        .build()
        .unwrap()
}

fn ramp(sizes: &[i64]) -> HostTensor {
    let n: i64 = sizes.iter().product();
    let values: Vec<f32> = (0..n).map(|i| i as f32).collect();
    HostTensor::from_f32(sizes, &values).unwrap()
}

#[test]
fn create_and_delete_releases_every_instance() -> Result<()> {
    for n in 1..=8 {
        let (graph, live) = counting(None);
        let container = ModelContainer::create(graph, n, true, None)?;
        assert_eq!(container.num_models(), n);
        assert_eq!(live.load(Ordering::SeqCst), n);
        drop(container);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }
    Ok(())
}

#[test]
fn zero_instances_is_rejected() {
    let err = ModelContainer::create(square(1.0, false), 0, true, None).err().unwrap();
    assert_eq!(err.class(), ErrorClass::Initialization);
}

#[test]
fn failed_instance_tears_down_the_rest() {
    let (graph, live) = counting(Some(2));
    let err = ModelContainer::create(graph, 4, true, None).err().unwrap();
    assert!(matches!(err, ContainerError::Init(_)));
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

#[test]
fn device_mode_validates_binaries_directory() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let missing = dir.path().join("cubins");

    let err = ModelContainer::create(square(1.0, false), 2, false, Some(&missing))
        .err()
        .unwrap();
    assert_eq!(err.class(), ErrorClass::Initialization);

    let container = ModelContainer::create(square(1.0, false), 2, false, Some(dir.path()))?;
    assert!(!container.is_cpu());
    assert_eq!(container.cubin_dir(), Some(dir.path()));

    // Host execution ignores the directory entirely.
    let container = ModelContainer::create(square(1.0, false), 1, true, Some(&missing))?;
    assert!(container.is_cpu());
    assert_eq!(container.cubin_dir(), None);
    Ok(())
}

#[test]
fn two_instance_cpu_example() -> Result<()> {
    let container = ModelContainer::create(square(1.0, false), 2, true, None)?;
    assert_eq!(container.num_inputs(), 1);
    assert_eq!(container.input_dtype(0)?, DType::F32);
    assert_eq!(container.max_input_shape(0)?.dims(), &[4, 4]);
    assert_eq!(container.max_output_shape(0)?.dims(), &[4, 4]);

    let input = ramp(&[2, 4]);
    let mut output = HostTensor::zeros(DType::F32, &[4, 4]);
    let shapes = container.run(&[&input], &mut [&mut output], None, None)?;
    assert_eq!(shapes.len(), 1);
    assert_eq!(shapes[0].rank(), 2);
    assert_eq!(shapes[0].dims(), &[2, 4]);

    let too_big = ramp(&[5, 4]);
    let err = container
        .run(&[&too_big], &mut [&mut output], None, None)
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::ContractViolation);
    assert_eq!(err.status(), 2);
    Ok(())
}

#[test]
fn max_shape_runs_and_oversize_leaves_outputs_untouched() -> Result<()> {
    let container = ModelContainer::create(square(2.0, false), 1, true, None)?;

    let input = ramp(&[4, 4]);
    let mut output = HostTensor::zeros(DType::F32, &[4, 4]);
    let shapes = container.run(&[&input], &mut [&mut output], None, None)?;
    assert_eq!(shapes[0].dims(), &[4, 4]);
    let values = output.to_f32_vec(&shapes[0])?;
    for (i, v) in values.iter().enumerate() {
        assert_abs_diff_eq!(*v, i as f32 * 2.0 + 1.0, epsilon = 1e-6);
    }

    for sizes in [[5, 4], [4, 5]] {
        let mut sentinel = HostTensor::zeros(DType::F32, &[4, 4]);
        sentinel.as_bytes_mut().fill(0xAB);
        let before = sentinel.clone();
        let err = container
            .run(&[&ramp(&sizes)], &mut [&mut sentinel], None, None)
            .unwrap_err();
        assert!(matches!(err, ContainerError::ShapeOutOfBounds { index: 0, .. }));
        assert_eq!(sentinel, before);
    }
    Ok(())
}

#[test]
fn contract_violations_keep_every_instance() -> Result<()> {
    let container = ModelContainer::create(square(1.0, false), 3, true, None)?;
    let good = ramp(&[1, 4]);
    let ints = HostTensor::zeros(DType::I32, &[1, 4]);
    let mut output = HostTensor::zeros(DType::F32, &[4, 4]);
    let mut small = HostTensor::zeros(DType::F32, &[1, 4]);

    let failures = [
        container.run(&[&ints], &mut [&mut output], None, None),
        container.run(&[&good, &good], &mut [&mut output], None, None),
        container.run(&[&good], &mut [], None, None),
        container.run(&[&good], &mut [&mut small], None, None),
    ];
    for result in failures {
        assert_eq!(result.unwrap_err().class(), ErrorClass::ContractViolation);
    }

    let stats = container.stats();
    assert_eq!((stats.free, stats.busy, stats.retired), (3, 0, 0));
    container.run(&[&good], &mut [&mut output], None, None)?;
    Ok(())
}

#[test]
fn introspection_is_stable_across_runs() -> Result<()> {
    let container = ModelContainer::create(square(1.0, false), 2, true, None)?;
    let snapshot = |c: &ModelContainer<AffineGraph>| -> Result<_> {
        Ok((
            c.num_inputs(),
            c.num_outputs(),
            c.input_name(0)?.to_string(),
            c.output_name(0)?.to_string(),
            c.input_dtype(0)?,
            c.output_dtype(0)?,
            c.max_input_shape(0)?.clone(),
            c.max_output_shape(0)?.clone(),
        ))
    };

    let before = snapshot(&container)?;
    let mut output = HostTensor::zeros(DType::F32, &[4, 4]);
    for rows in 1..=4 {
        container.run(&[&ramp(&[rows, 4])], &mut [&mut output], None, None)?;
    }
    assert_eq!(snapshot(&container)?, before);
    assert_eq!(before.2, "x");
    assert_eq!(before.3, "y");

    assert!(matches!(
        container.input_name(1),
        Err(ContainerError::IndexOutOfRange { index: 1, count: 1, .. })
    ));
    assert!(container.max_output_shape(7).is_err());
    Ok(())
}

#[test]
fn repeated_runs_are_bit_identical() -> Result<()> {
    let container = ModelContainer::create(square(0.3, false), 2, true, None)?;
    let input = ramp(&[3, 4]);
    let mut first = HostTensor::zeros(DType::F32, &[4, 4]);
    container.run(&[&input], &mut [&mut first], None, None)?;

    for _ in 0..20 {
        let mut again = HostTensor::zeros(DType::F32, &[4, 4]);
        container.run(&[&input], &mut [&mut again], None, None)?;
        assert_eq!(again.as_bytes(), first.as_bytes());
    }
    Ok(())
}

#[test]
fn parallelism_is_bounded_by_instance_count() -> Result<()> {
    const N: usize = 2;
    let container = ModelContainer::create(square(1.0, true), N, true, None)?;
    let gate = Gate::default();
    let finished = AtomicUsize::new(0);

    thread::scope(|scope| {
        for _ in 0..=N {
            scope.spawn(|| {
                let input = ramp(&[1, 4]);
                let mut output = HostTensor::zeros(DType::F32, &[4, 4]);
                container
                    .run(&[&input], &mut [&mut output], None, Some(&gate))
                    .unwrap();
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }

        gate.wait_for_active(N);
        thread::sleep(Duration::from_millis(100));
        // The extra caller is parked waiting for an instance.
        assert_eq!(gate.active(), N);
        assert_eq!(container.stats().busy, N);
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        gate.release(1);
        wait_until(|| finished.load(Ordering::SeqCst) == 1);
        gate.wait_for_active(N);

        gate.release(N);
    });

    assert_eq!(finished.load(Ordering::SeqCst), N + 1);
    assert_eq!(gate.peak(), N);
    let stats = container.stats();
    assert_eq!((stats.free, stats.busy, stats.completed), (N, 0, (N + 1) as u64));
    Ok(())
}

#[test]
fn bounded_wait_times_out_while_all_instances_are_busy() -> Result<()> {
    let container = ModelContainer::create(square(1.0, true), 1, true, None)?;
    let gate = Gate::default();

    thread::scope(|scope| {
        scope.spawn(|| {
            let input = ramp(&[1, 4]);
            let mut output = HostTensor::zeros(DType::F32, &[4, 4]);
            container
                .run(&[&input], &mut [&mut output], None, Some(&gate))
                .unwrap();
        });
        gate.wait_for_active(1);

        let input = ramp(&[1, 4]);
        let mut output = HostTensor::zeros(DType::F32, &[4, 4]);
        let err = container
            .run_timeout(
                &[&input],
                &mut [&mut output],
                None,
                Some(&gate),
                Duration::from_millis(50),
            )
            .unwrap_err();
        assert!(matches!(err, ContainerError::Timeout(_)));

        gate.release(1);
    });
    Ok(())
}

#[test]
fn delegated_operator_sees_intermediate_buffer() -> Result<()> {
    let container = ModelContainer::create(square(1.0, true), 1, true, None)?;
    let seen = AtomicUsize::new(0);
    let square_values = |call: &mut ProxyCall<'_, '_>| {
        assert_eq!(call.extern_node_index, 0);
        let numel = call.int_args[0] as usize;
        seen.store(numel, Ordering::SeqCst);
        let bytes = call.tensor_args[0].as_bytes_mut();
        for chunk in bytes.chunks_exact_mut(4).take(numel) {
            let v = f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            chunk.copy_from_slice(&(v * v).to_ne_bytes());
        }
        Ok::<(), ProxyError>(())
    };

    let input = HostTensor::from_f32(&[1, 3], &[1.0, 2.0, 3.0])?;
    let mut output = HostTensor::zeros(DType::F32, &[4, 4]);
    let shapes = container.run(&[&input], &mut [&mut output], None, Some(&square_values))?;
    assert_eq!(seen.load(Ordering::SeqCst), 3);
    assert_eq!(output.to_f32_vec(&shapes[0])?, vec![4.0, 9.0, 16.0]);
    Ok(())
}

#[test]
fn missing_proxy_is_a_contract_violation() -> Result<()> {
    let container = ModelContainer::create(square(1.0, true), 1, true, None)?;
    let input = ramp(&[1, 4]);
    let mut output = HostTensor::zeros(DType::F32, &[4, 4]);
    let err = container
        .run(&[&input], &mut [&mut output], None, None)
        .unwrap_err();
    assert!(matches!(err, ContainerError::MissingProxy));
    assert_eq!(container.stats().retired, 0);
    Ok(())
}

#[test]
fn delegated_failure_retires_instance() -> Result<()> {
    let container = ModelContainer::create(square(1.0, true), 2, true, None)?;
    let failing = |_: &mut ProxyCall<'_, '_>| Err::<(), ProxyError>(ProxyError::new("kernel crashed"));
    let working = |_: &mut ProxyCall<'_, '_>| Ok::<(), ProxyError>(());
    let input = ramp(&[1, 4]);
    let mut output = HostTensor::zeros(DType::F32, &[4, 4]);

    let err = container
        .run(&[&input], &mut [&mut output], None, Some(&failing))
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::DelegatedExecution);
    assert_eq!(err.status(), 3);
    assert_eq!(container.stats().retired, 1);

    // The surviving instance keeps serving.
    for _ in 0..3 {
        container.run(&[&input], &mut [&mut output], None, Some(&working))?;
    }

    container
        .run(&[&input], &mut [&mut output], None, Some(&failing))
        .unwrap_err();
    let err = container
        .run(&[&input], &mut [&mut output], None, Some(&working))
        .unwrap_err();
    assert!(matches!(err, ContainerError::Exhausted(2)));
    assert_eq!(err.status(), 4);
    Ok(())
}
