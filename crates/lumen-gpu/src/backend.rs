//! wgpu implementation of the kernel contract

use bytemuck::{Pod, Zeroable};
use lumen_core::error::{Error, Result};
use lumen_core::kernel::{self, AttentionShape, BackendKind, Kernels, RopeSpec, RopeStyle};
use lumen_core::{TensorOrigin, TensorView};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use wgpu::util::DeviceExt;

const WORKGROUP: u32 = 64;

const READ_BACK: wgpu::BufferUsages =
    wgpu::BufferUsages::STORAGE.union(wgpu::BufferUsages::COPY_SRC);

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct GemvParams {
    rows: u32,
    cols: u32,
    pad: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct NormParams {
    n: u32,
    eps: f32,
    pad: [u32; 2],
}

/// Length-only parameters shared by softmax and the SiLU shaders
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct LenParams {
    n: u32,
    pad: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct RopeParams {
    head_dim: u32,
    pairs: u32,
    n_heads: u32,
    neox: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct AttentionParams {
    n_heads: u32,
    group: u32,
    head_dim: u32,
    seq_len: u32,
    kv_dim: u32,
    scale: f32,
    pad: [u32; 2],
}

struct Pipelines {
    gemv: wgpu::ComputePipeline,
    rmsnorm: wgpu::ComputePipeline,
    softmax: wgpu::ComputePipeline,
    rope: wgpu::ComputePipeline,
    silu: wgpu::ComputePipeline,
    silu_mul: wgpu::ComputePipeline,
    attn_scores: wgpu::ComputePipeline,
    attn_values: wgpu::ComputePipeline,
}

impl Pipelines {
    fn new(device: &wgpu::Device) -> Self {
        let build = |label: &str, source: &str| {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: None,
                module: &module,
                entry_point: "main",
            })
        };
        Self {
            gemv: build("gemv", include_str!("shaders/gemv.wgsl")),
            rmsnorm: build("rmsnorm", include_str!("shaders/rmsnorm.wgsl")),
            softmax: build("softmax", include_str!("shaders/softmax.wgsl")),
            rope: build("rope", include_str!("shaders/rope.wgsl")),
            silu: build("silu", include_str!("shaders/silu.wgsl")),
            silu_mul: build("silu_mul", include_str!("shaders/silu_mul.wgsl")),
            attn_scores: build("attn_scores", include_str!("shaders/attn_scores.wgsl")),
            attn_values: build("attn_values", include_str!("shaders/attn_values.wgsl")),
        }
    }
}

/// Device memory allowed for resident weights unless overridden
pub const DEFAULT_WEIGHT_BUDGET: u64 = 2 << 30;

struct Resident {
    buffer: Arc<wgpu::Buffer>,
    bytes: u64,
    last_used: u64,
}

/// Store-backed weights resident on the device, least recently used first out
struct ResidentWeights {
    entries: HashMap<TensorOrigin, Resident>,
    bytes: u64,
    budget: u64,
    clock: u64,
}

impl ResidentWeights {
    fn new(budget: u64) -> Self {
        Self { entries: HashMap::new(), bytes: 0, budget, clock: 0 }
    }

    fn get(&mut self, origin: &TensorOrigin) -> Option<Arc<wgpu::Buffer>> {
        self.clock += 1;
        let clock = self.clock;
        self.entries.get_mut(origin).map(|r| {
            r.last_used = clock;
            Arc::clone(&r.buffer)
        })
    }

    /// Evict until `incoming` more bytes fit; false if they never can
    fn make_room(&mut self, incoming: u64) -> bool {
        if incoming > self.budget {
            return false;
        }
        while self.bytes + incoming > self.budget {
            let Some(oldest) =
                self.entries.iter().min_by_key(|(_, r)| r.last_used).map(|(k, _)| *k)
            else {
                break;
            };
            if let Some(r) = self.entries.remove(&oldest) {
                self.bytes -= r.bytes;
            }
        }
        true
    }

    fn insert(&mut self, origin: TensorOrigin, buffer: Arc<wgpu::Buffer>, bytes: u64) {
        self.clock += 1;
        self.bytes += bytes;
        self.entries.insert(origin, Resident { buffer, bytes, last_used: self.clock });
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }
}

/// GPU compute backend
///
/// Weight matrices read from a [`lumen_core::TensorStore`] are dequantized to
/// f32 on first use and stay resident, keyed by store and tensor, within a
/// byte budget. Views over caller-owned memory are uploaded on every call.
/// Every kernel call encodes its dispatches into one command encoder and
/// blocks on a single readback.
pub struct GpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    pipelines: Pipelines,
    weights: Mutex<ResidentWeights>,
    submit: Mutex<()>,
}

fn unavailable(reason: impl ToString) -> Error {
    Error::backend_unavailable(BackendKind::Gpu.name(), reason)
}

impl GpuBackend {
    /// Acquire an adapter and device and compile every shader
    pub async fn new_async() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| unavailable("no compatible GPU adapter"))?;
        let info = adapter.get_info();

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("lumen"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                },
                None,
            )
            .await
            .map_err(|e| unavailable(format!("failed to create device: {}", e)))?;

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipelines = Pipelines::new(&device);
        if let Some(err) = device.pop_error_scope().await {
            return Err(unavailable(format!("shader compilation failed: {}", err)));
        }

        log::info!("GPU backend on {} ({:?})", info.name, info.backend);
        Ok(Self {
            device,
            queue,
            adapter_name: info.name,
            pipelines,
            weights: Mutex::new(ResidentWeights::new(DEFAULT_WEIGHT_BUDGET)),
            submit: Mutex::new(()),
        })
    }

    /// Blocking form of [`GpuBackend::new_async`]
    pub fn new() -> Result<Self> {
        pollster::block_on(Self::new_async())
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// Number of weight matrices resident on the device
    pub fn cached_weights(&self) -> usize {
        self.weights.lock().entries.len()
    }

    /// Bytes held by resident weight matrices
    pub fn cached_weight_bytes(&self) -> u64 {
        self.weights.lock().bytes
    }

    /// Cap resident weight memory, evicting least recently used matrices
    pub fn set_weight_budget(&self, bytes: u64) {
        let mut weights = self.weights.lock();
        weights.budget = bytes;
        weights.make_room(0);
    }

    pub fn clear_weight_cache(&self) {
        self.weights.lock().clear();
    }

    fn check_size(&self, label: &str, len: usize) -> Result<u64> {
        let bytes = (len * std::mem::size_of::<f32>()) as u64;
        let limit = self.device.limits().max_storage_buffer_binding_size as u64;
        if bytes > limit {
            return Err(Error::InvalidShape(format!(
                "GPU buffer '{}' needs {} bytes, device limit is {}",
                label, bytes, limit
            )));
        }
        Ok(bytes)
    }

    fn upload(
        &self,
        label: &str,
        data: &[f32],
        usage: wgpu::BufferUsages,
    ) -> Result<wgpu::Buffer> {
        self.check_size(label, data.len())?;
        Ok(self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(data),
            usage,
        }))
    }

    fn scratch(&self, label: &str, len: usize) -> Result<wgpu::Buffer> {
        let size = self.check_size(label, len)?;
        Ok(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: READ_BACK,
            mapped_at_creation: false,
        }))
    }

    fn uniform<T: Pod>(&self, label: &str, params: &T) -> wgpu::Buffer {
        self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::bytes_of(params),
            usage: wgpu::BufferUsages::UNIFORM,
        })
    }

    fn bind(
        &self,
        pipeline: &wgpu::ComputePipeline,
        label: &str,
        buffers: &[&wgpu::Buffer],
    ) -> wgpu::BindGroup {
        let layout = pipeline.get_bind_group_layout(0);
        let entries: Vec<wgpu::BindGroupEntry<'_>> = buffers
            .iter()
            .enumerate()
            .map(|(i, b)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: b.as_entire_binding(),
            })
            .collect();
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &layout,
            entries: &entries,
        })
    }

    fn workgroups(&self, invocations: usize, size: u32) -> Result<u32> {
        let groups = (invocations as u64).div_ceil(size as u64);
        let max = self.device.limits().max_compute_workgroups_per_dimension as u64;
        if groups > max {
            return Err(Error::InvalidShape(format!(
                "{} invocations need {} workgroups, device limit is {}",
                invocations, groups, max
            )));
        }
        Ok(groups as u32)
    }

    fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    /// Submit `encoder` and copy `src` back into `out`
    fn finish(
        &self,
        mut encoder: wgpu::CommandEncoder,
        src: &wgpu::Buffer,
        out: &mut [f32],
    ) -> Result<()> {
        let size = (out.len() * std::mem::size_of::<f32>()) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        encoder.copy_buffer_to_buffer(src, 0, &staging, 0, size);

        let _guard = self.submit.lock();
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        pollster::block_on(receiver)
            .map_err(|_| Error::Runtime("GPU readback was cancelled".to_string()))?
            .map_err(|e| Error::Runtime(format!("Failed to map GPU buffer: {}", e)))?;

        {
            let data = slice.get_mapped_range();
            out.copy_from_slice(bytemuck::cast_slice(&data));
        }
        staging.unmap();
        Ok(())
    }

    /// Device copy of a weight matrix
    ///
    /// Store-backed views are cached by origin; other views may change
    /// between calls and are uploaded fresh.
    fn weight_buffer(&self, matrix: &TensorView<'_>) -> Result<Arc<wgpu::Buffer>> {
        let Some(origin) = matrix.origin() else {
            let values = matrix.to_f32_vec()?;
            return Ok(Arc::new(self.upload(
                matrix.name(),
                &values,
                wgpu::BufferUsages::STORAGE,
            )?));
        };
        let mut weights = self.weights.lock();
        if let Some(buffer) = weights.get(&origin) {
            return Ok(buffer);
        }
        let values = matrix.to_f32_vec()?;
        let bytes = self.check_size(matrix.name(), values.len())?;
        let buffer = Arc::new(self.upload(matrix.name(), &values, wgpu::BufferUsages::STORAGE)?);
        if weights.make_room(bytes) {
            weights.insert(origin, Arc::clone(&buffer), bytes);
            log::debug!(
                "Uploaded '{}' ({} {}x{}) to the GPU, {} bytes resident",
                matrix.name(),
                matrix.kind(),
                matrix.rows(),
                matrix.cols(),
                weights.bytes
            );
        } else {
            log::warn!("'{}' ({} bytes) exceeds the GPU weight budget", matrix.name(), bytes);
        }
        Ok(buffer)
    }

    /// Run a one-buffer in-place shader over `x`
    fn in_place(
        &self,
        pipeline: &wgpu::ComputePipeline,
        label: &str,
        x: &mut [f32],
        groups: u32,
    ) -> Result<()> {
        let data = self.upload(label, x, READ_BACK)?;
        let params = self.uniform(label, &LenParams { n: x.len() as u32, pad: [0; 3] });
        let bind = self.bind(pipeline, label, &[&data, &params]);
        let mut encoder = self.encoder(label);
        encode_pass(&mut encoder, pipeline, &bind, groups);
        self.finish(encoder, &data, x)
    }
}

fn encode_pass(
    encoder: &mut wgpu::CommandEncoder,
    pipeline: &wgpu::ComputePipeline,
    bind: &wgpu::BindGroup,
    groups: u32,
) {
    let mut pass = encoder
        .begin_compute_pass(&wgpu::ComputePassDescriptor { label: None, timestamp_writes: None });
    pass.set_pipeline(pipeline);
    pass.set_bind_group(0, bind, &[]);
    pass.dispatch_workgroups(groups, 1, 1);
}

impl std::fmt::Debug for GpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBackend")
            .field("adapter", &self.adapter_name)
            .field("cached_weights", &self.cached_weights())
            .finish()
    }
}

impl Kernels for GpuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Gpu
    }

    fn gemv(&self, matrix: &TensorView<'_>, x: &[f32], out: &mut [f32]) -> Result<()> {
        kernel::check_gemv(matrix, x, out)?;
        if out.is_empty() {
            return Ok(());
        }
        let weights = self.weight_buffer(matrix)?;
        let input = self.upload("gemv x", x, wgpu::BufferUsages::STORAGE)?;
        let result = self.scratch("gemv out", out.len())?;
        let params = self.uniform(
            "gemv params",
            &GemvParams { rows: matrix.rows() as u32, cols: matrix.cols() as u32, pad: [0; 2] },
        );
        let bind = self.bind(&self.pipelines.gemv, "gemv", &[&weights, &input, &result, &params]);
        let mut encoder = self.encoder("gemv");
        let groups = self.workgroups(out.len(), WORKGROUP)?;
        encode_pass(&mut encoder, &self.pipelines.gemv, &bind, groups);
        self.finish(encoder, &result, out)
    }

    fn rmsnorm(&self, x: &[f32], weight: &[f32], eps: f32, out: &mut [f32]) -> Result<()> {
        kernel::check_rmsnorm(x, weight, out)?;
        let input = self.upload("rmsnorm x", x, wgpu::BufferUsages::STORAGE)?;
        let w = self.upload("rmsnorm weight", weight, wgpu::BufferUsages::STORAGE)?;
        let result = self.scratch("rmsnorm out", out.len())?;
        let params =
            self.uniform("rmsnorm params", &NormParams { n: x.len() as u32, eps, pad: [0; 2] });
        let bind = self.bind(&self.pipelines.rmsnorm, "rmsnorm", &[&input, &w, &result, &params]);
        let mut encoder = self.encoder("rmsnorm");
        encode_pass(&mut encoder, &self.pipelines.rmsnorm, &bind, 1);
        self.finish(encoder, &result, out)
    }

    fn rope(&self, x: &mut [f32], pos: usize, spec: &RopeSpec) -> Result<()> {
        kernel::check_rope(x, spec)?;
        let pairs = spec.rope_dim / 2;
        if pairs == 0 || x.is_empty() {
            return Ok(());
        }
        let n_heads = x.len() / spec.head_dim;
        let table: Vec<f32> = spec.cos_sin(pos).into_iter().flat_map(|(c, s)| [c, s]).collect();

        let data = self.upload("rope x", x, READ_BACK)?;
        let table = self.upload("rope table", &table, wgpu::BufferUsages::STORAGE)?;
        let params = self.uniform(
            "rope params",
            &RopeParams {
                head_dim: spec.head_dim as u32,
                pairs: pairs as u32,
                n_heads: n_heads as u32,
                neox: u32::from(spec.style == RopeStyle::Neox),
            },
        );
        let bind = self.bind(&self.pipelines.rope, "rope", &[&data, &table, &params]);
        let mut encoder = self.encoder("rope");
        let groups = self.workgroups(n_heads * pairs, WORKGROUP)?;
        encode_pass(&mut encoder, &self.pipelines.rope, &bind, groups);
        self.finish(encoder, &data, x)
    }

    fn silu(&self, x: &mut [f32]) -> Result<()> {
        if x.is_empty() {
            return Ok(());
        }
        let groups = self.workgroups(x.len(), WORKGROUP)?;
        self.in_place(&self.pipelines.silu, "silu", x, groups)
    }

    fn silu_mul(&self, gate: &mut [f32], up: &[f32]) -> Result<()> {
        kernel::check_len("silu_mul up", gate.len(), up.len())?;
        if gate.is_empty() {
            return Ok(());
        }
        let g = self.upload("silu_mul gate", gate, READ_BACK)?;
        let u = self.upload("silu_mul up", up, wgpu::BufferUsages::STORAGE)?;
        let params =
            self.uniform("silu_mul params", &LenParams { n: gate.len() as u32, pad: [0; 3] });
        let bind = self.bind(&self.pipelines.silu_mul, "silu_mul", &[&g, &u, &params]);
        let mut encoder = self.encoder("silu_mul");
        let groups = self.workgroups(gate.len(), WORKGROUP)?;
        encode_pass(&mut encoder, &self.pipelines.silu_mul, &bind, groups);
        self.finish(encoder, &g, gate)
    }

    fn softmax(&self, x: &mut [f32]) -> Result<()> {
        if x.is_empty() {
            return Ok(());
        }
        // one 256-wide workgroup covers the whole row
        self.in_place(&self.pipelines.softmax, "softmax", x, 1)
    }

    fn attention(
        &self,
        q: &[f32],
        keys: &[f32],
        values: &[f32],
        shape: &AttentionShape,
        position: usize,
        out: &mut [f32],
    ) -> Result<()> {
        kernel::check_attention(q, keys, values, shape, position, out)?;
        let seq_len = position + 1;
        let cached = seq_len * shape.kv_dim();

        let q_buf = self.upload("attn q", q, wgpu::BufferUsages::STORAGE)?;
        let k_buf = self.upload("attn keys", &keys[..cached], wgpu::BufferUsages::STORAGE)?;
        let v_buf = self.upload("attn values", &values[..cached], wgpu::BufferUsages::STORAGE)?;
        let scores = self.scratch("attn scores", shape.n_heads * seq_len)?;
        let result = self.scratch("attn out", out.len())?;
        let params = self.uniform(
            "attn params",
            &AttentionParams {
                n_heads: shape.n_heads as u32,
                group: (shape.n_heads / shape.n_kv_heads) as u32,
                head_dim: shape.head_dim as u32,
                seq_len: seq_len as u32,
                kv_dim: shape.kv_dim() as u32,
                scale: shape.scale(),
                pad: [0; 2],
            },
        );
        let row = self.uniform("attn row", &LenParams { n: seq_len as u32, pad: [0; 3] });

        let p = &self.pipelines;
        let score_bind =
            self.bind(&p.attn_scores, "attn scores", &[&q_buf, &k_buf, &scores, &params]);
        let softmax_bind = self.bind(&p.softmax, "attn softmax", &[&scores, &row]);
        let value_bind =
            self.bind(&p.attn_values, "attn values", &[&scores, &v_buf, &result, &params]);

        // scores, one softmax workgroup per head, then the weighted value sum
        let mut encoder = self.encoder("attention");
        let groups = self.workgroups(shape.n_heads * seq_len, WORKGROUP)?;
        encode_pass(&mut encoder, &p.attn_scores, &score_bind, groups);
        encode_pass(&mut encoder, &p.softmax, &softmax_bind, self.workgroups(shape.n_heads, 1)?);
        let groups = self.workgroups(out.len(), WORKGROUP)?;
        encode_pass(&mut encoder, &p.attn_values, &value_bind, groups);
        self.finish(encoder, &result, out)
    }
}
