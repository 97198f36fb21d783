use anyhow::Result;
use aoti_container::ffi::AotContainer;
use aoti_container::reference::{AffineGraph, AffineScratch};
use aoti_container::{
    CompiledGraph, DType, HostTensor, InstanceOptions, ModelContainer, ModelSignature,
    RunContext, Shape, StreamHandle, Tensor, TensorMut,
};
use std::cell::RefCell;
use std::ffi::c_void;

thread_local! {
    // Runs execute on the calling thread, so each test sees only its own.
    static SEEN: RefCell<Vec<Option<usize>>> = const { RefCell::new(Vec::new()) };
}

/// Affine graph that records the stream of every run.
struct StreamRecorder {
    inner: AffineGraph,
}

impl CompiledGraph for StreamRecorder {
    type Scratch = AffineScratch;

    fn signature(&self) -> &ModelSignature {
        self.inner.signature()
    }

    fn instantiate(&self, options: &InstanceOptions<'_>) -> aoti_container::Result<AffineScratch> {
        self.inner.instantiate(options)
    }

    fn execute(
        &self,
        scratch: &mut AffineScratch,
        inputs: &[&dyn Tensor],
        outputs: &mut [&mut dyn TensorMut],
        ctx: &RunContext<'_>,
    ) -> aoti_container::Result<Vec<Shape>> {
        SEEN.with(|seen| {
            seen.borrow_mut()
                .push(ctx.stream.map(|s| s.as_raw() as usize))
        });
        self.inner.execute(scratch, inputs, outputs, ctx)
    }
}

fn recorder() -> aoti_container::Result<StreamRecorder> {
    Ok(StreamRecorder {
        inner: AffineGraph::builder().build()?,
    })
}

aoti_container::export_model_container!(StreamRecorder, recorder);

fn take_seen() -> Vec<Option<usize>> {
    SEEN.with(|seen| std::mem::take(&mut *seen.borrow_mut()))
}

#[test]
fn stream_reaches_graph_through_rust_api() -> Result<()> {
    let container = ModelContainer::create(recorder()?, 2, true, None)?;
    let mut queue = 0u64;
    let raw = &mut queue as *mut u64 as *mut c_void;
    let stream = StreamHandle::from_raw(raw);

    let input = HostTensor::zeros(DType::F32, &[2, 4]);
    let mut output = HostTensor::zeros(DType::F32, &[4, 4]);
    container.run(&[&input], &mut [&mut output], stream, None)?;
    container.run(&[&input], &mut [&mut output], None, None)?;

    assert_eq!(take_seen(), vec![Some(raw as usize), None]);
    Ok(())
}

#[test]
fn stream_reaches_graph_through_c_abi() -> Result<()> {
    let container = AotContainer::create(container_api(), 1, true, None)?;
    let mut queue = 0u64;
    let raw = &mut queue as *mut u64 as *mut c_void;
    let stream = StreamHandle::from_raw(raw);

    let input = HostTensor::zeros(DType::F32, &[1, 4]);
    let mut output = HostTensor::zeros(DType::F32, &[4, 4]);
    container.run(&[&input], &mut [&mut output], stream, None)?;
    container.run(&[&input], &mut [&mut output], None, None)?;

    assert_eq!(take_seen(), vec![Some(raw as usize), None]);
    Ok(())
}
