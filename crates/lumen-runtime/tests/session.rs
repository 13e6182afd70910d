use lumen_core::fixture::{build, tiny_llama, FixtureConfig};
use lumen_core::{load, load_from_bytes, BackendKind, Error, LoadedModel, QuantKind};
use lumen_cpu::PlainBackend;
use lumen_runtime::{
    argmax, check_close, create_backend, GenerationConfig, InferenceSession, LogitsProcessor,
    SessionConfig, WeightCache, WeightStorage,
};
use std::io::Write;
use std::sync::Arc;

const PROMPT: [u32; 3] = [1, 2, 3];

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn tiny() -> Arc<LoadedModel> {
    Arc::new(load_from_bytes(tiny_llama().unwrap()).unwrap())
}

fn model(cfg: &FixtureConfig) -> Arc<LoadedModel> {
    Arc::new(load_from_bytes(build(cfg).unwrap()).unwrap())
}

/// The tiny model with no EOS id, so greedy runs always use every token they are allowed
fn open_ended() -> Arc<LoadedModel> {
    model(&FixtureConfig { eos_token_id: None, ..FixtureConfig::tiny() })
}

/// Distance between the two largest logits
fn top_two_gap(logits: &[f32]) -> f32 {
    let mut sorted = logits.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    sorted[0] - sorted[1]
}

/// Session for `kind`, or `None` when the backend cannot start here
fn session(model: &Arc<LoadedModel>, config: &SessionConfig) -> Option<InferenceSession> {
    match InferenceSession::from_config(Arc::clone(model), config) {
        Ok(s) => Some(s),
        Err(Error::BackendUnavailable { backend, reason }) => {
            eprintln!("Skipping {} backend: {}", backend, reason);
            None
        }
        Err(e) => panic!("session creation failed: {}", e),
    }
}

fn prefill(session: &mut InferenceSession, prompt: &[u32]) -> Vec<f32> {
    let mut logits = Vec::new();
    for &t in prompt {
        logits = session.step(t).unwrap().to_vec();
    }
    logits
}

#[test]
fn test_backends_agree_with_plain_on_tiny_model() {
    init_logger();
    let model = tiny();
    let mut reference = session(&model, &SessionConfig::new(BackendKind::Plain)).unwrap();
    let expected: Vec<Vec<f32>> =
        PROMPT.iter().map(|&t| reference.step(t).unwrap().to_vec()).collect();

    for kind in [BackendKind::Sequential, BackendKind::Multithread, BackendKind::Gpu] {
        let Some(mut s) = session(&model, &SessionConfig::new(kind).with_threads(3)) else {
            continue;
        };
        for (&t, want) in PROMPT.iter().zip(&expected) {
            let got = s.step(t).unwrap();
            check_close(kind.name(), want, got, 1e-3).unwrap();
        }
        // Agreement within tolerance only pins the argmax when the winner is clear
        let gap = top_two_gap(&expected[2]);
        let max = expected[2].iter().fold(0.0f32, |m, v| m.max(v.abs()));
        assert!(gap > 2.0 * 1e-3 * max.max(1.0), "top-2 logit gap {} too small", gap);
        assert_eq!(argmax(s.logits()), argmax(&expected[2]), "{} disagrees on next token", kind);
    }
}

#[test]
fn test_backends_agree_on_quantized_gqa_model() {
    for weight_kind in [QuantKind::Q8_0, QuantKind::Q4_0, QuantKind::F16] {
        let model = model(&FixtureConfig::small_gqa(weight_kind));
        let mut reference = session(&model, &SessionConfig::new(BackendKind::Plain)).unwrap();
        let expected = prefill(&mut reference, &[4, 9, 1, 30]);

        for kind in [BackendKind::Sequential, BackendKind::Multithread, BackendKind::Gpu] {
            let Some(mut s) = session(&model, &SessionConfig::new(kind)) else {
                continue;
            };
            let got = prefill(&mut s, &[4, 9, 1, 30]);
            check_close(kind.name(), &expected, &got, 1e-3).unwrap();
        }
    }
}

#[test]
fn test_position_advances_and_logits_cover_vocab() {
    let model = tiny();
    let mut s = session(&model, &SessionConfig::default()).unwrap();
    assert_eq!(s.position(), 0);
    assert_eq!(s.context_length(), 16);
    let logits = s.step(5).unwrap();
    assert_eq!(logits.len(), 16);
    assert!(logits.iter().all(|v| v.is_finite()));
    assert_eq!(s.position(), 1);
    assert_eq!(s.kv_cache().len(0), 1);
}

#[test]
fn test_step_past_context_is_cache_exhausted() {
    let model = tiny();
    let mut s = session(&model, &SessionConfig::default().with_context_length(2)).unwrap();
    s.step(1).unwrap();
    s.step(2).unwrap();
    match s.step(3) {
        Err(Error::CacheExhausted { position, capacity }) => {
            assert_eq!(position, 2);
            assert_eq!(capacity, 2);
        }
        other => panic!("expected CacheExhausted, got {:?}", other.map(|l| l.len())),
    }
    assert_eq!(s.position(), 2);

    s.reset();
    assert_eq!(s.position(), 0);
    assert!(s.kv_cache().is_empty());
    s.step(1).unwrap();
}

#[test]
fn test_out_of_vocab_token_rejected_before_any_work() {
    let model = tiny();
    let mut s = session(&model, &SessionConfig::default()).unwrap();
    assert!(matches!(s.step(16), Err(Error::InvalidArgument(_))));
    assert_eq!(s.position(), 0);
    s.step(15).unwrap();
}

#[test]
fn test_context_override_cannot_exceed_model() {
    let model = tiny();
    let config = SessionConfig::default().with_context_length(17);
    assert!(matches!(
        InferenceSession::from_config(model, &config),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_backend_must_match_config() {
    let model = tiny();
    let config = SessionConfig::new(BackendKind::Multithread);
    let result = InferenceSession::new(model, Arc::new(PlainBackend::new()), &config);
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

#[test]
fn test_reset_reproduces_logits() {
    let model = tiny();
    let mut s = session(&model, &SessionConfig::default()).unwrap();
    let first = prefill(&mut s, &PROMPT);
    s.reset();
    let second = prefill(&mut s, &PROMPT);
    assert_eq!(first, second);
}

#[test]
fn test_sessions_share_model_independently() {
    let model = tiny();
    let mut a = session(&model, &SessionConfig::default()).unwrap();
    let mut b = session(&model, &SessionConfig::default()).unwrap();
    let la = prefill(&mut a, &PROMPT);
    b.step(7).unwrap();
    b.reset();
    let lb = prefill(&mut b, &PROMPT);
    assert_eq!(la, lb);
    assert_eq!(Arc::strong_count(&model), 3);
}

#[test]
fn test_f32_storage_matches_native_on_f32_model() {
    let model = tiny();
    let mut native = session(&model, &SessionConfig::default()).unwrap();
    let config = SessionConfig::default().with_weight_storage(WeightStorage::F32);
    let mut dense = session(&model, &config).unwrap();
    assert_eq!(prefill(&mut native, &PROMPT), prefill(&mut dense, &PROMPT));
}

#[test]
fn test_f32_storage_close_to_native_on_quantized_model() {
    let model = model(&FixtureConfig::small_gqa(QuantKind::Q8_0));
    let mut native = session(&model, &SessionConfig::default()).unwrap();
    let config = SessionConfig::default().with_weight_storage(WeightStorage::F32);
    let mut dense = session(&model, &config).unwrap();
    let a = prefill(&mut native, &[3, 1, 4]);
    let b = prefill(&mut dense, &[3, 1, 4]);
    check_close("f32 storage", &a, &b, 1e-5).unwrap();
}

#[test]
fn test_weight_cache_shared_between_sessions() {
    let model = model(&FixtureConfig::small_gqa(QuantKind::Q4_0));
    let cache = WeightCache::new();
    let config = SessionConfig::default().with_weight_storage(WeightStorage::F32);
    let backend = create_backend(&config).unwrap();

    InferenceSession::with_weight_cache(Arc::clone(&model), Arc::clone(&backend), &config, &cache)
        .unwrap();
    let materialized = cache.len();
    assert!(materialized > 0);
    InferenceSession::with_weight_cache(Arc::clone(&model), backend, &config, &cache).unwrap();
    assert_eq!(cache.len(), materialized);
    assert_eq!(cache.misses(), materialized);
    assert!(cache.hits() >= materialized);
}

#[test]
fn test_tied_output_projection() {
    let mut cfg = FixtureConfig::tiny();
    cfg.tied = true;
    let model = model(&cfg);
    assert!(model.is_tied());
    let mut s = session(&model, &SessionConfig::default()).unwrap();
    let logits = prefill(&mut s, &PROMPT);
    assert_eq!(logits.len(), 16);
    assert!(logits.iter().all(|v| v.is_finite()));
}

#[test]
fn test_generate_greedy_is_deterministic() {
    let model = open_ended();
    let config = GenerationConfig::greedy(6);
    let mut s = session(&model, &SessionConfig::default()).unwrap();
    let first = s.generate(&PROMPT, &config).unwrap();
    assert_eq!(first.len(), 6);

    s.reset();
    assert_eq!(s.generate(&PROMPT, &config).unwrap(), first);

    // Greedy decoding starts from the prefill argmax
    let mut other = session(&model, &SessionConfig::default()).unwrap();
    let logits = prefill(&mut other, &PROMPT);
    assert_eq!(first[0], argmax(&logits));
}

#[test]
fn test_generate_stops_at_stop_token() {
    let model = open_ended();
    let mut s = session(&model, &SessionConfig::default()).unwrap();
    let full = s.generate(&PROMPT, &GenerationConfig::greedy(8)).unwrap();
    assert_eq!(full.len(), 8);

    let stop = full[1];
    let cut = full.iter().position(|&t| t == stop).unwrap();
    assert!(cut <= 1);
    let mut config = GenerationConfig::greedy(8);
    config.stop_tokens = vec![stop];
    s.reset();
    assert_eq!(s.generate(&PROMPT, &config).unwrap(), full[..cut].to_vec());
}

#[test]
fn test_generate_stops_at_model_eos() {
    let mut s = session(&open_ended(), &SessionConfig::default()).unwrap();
    let full = s.generate(&PROMPT, &GenerationConfig::greedy(8)).unwrap();
    assert_eq!(full.len(), 8);

    // Same weights; only the EOS metadata differs
    let eos = full[2];
    let cut = full.iter().position(|&t| t == eos).unwrap();
    let model = model(&FixtureConfig { eos_token_id: Some(eos), ..FixtureConfig::tiny() });
    assert_eq!(model.eos_token_id(), Some(eos));
    let mut s = session(&model, &SessionConfig::default()).unwrap();
    let out = s.generate(&PROMPT, &GenerationConfig::greedy(8)).unwrap();
    assert_eq!(out, full[..cut].to_vec());
    assert!(!out.contains(&eos));
}

#[test]
fn test_generate_respects_max_tokens() {
    let model = open_ended();
    let mut s = session(&model, &SessionConfig::default()).unwrap();
    assert!(s.generate(&PROMPT, &GenerationConfig::greedy(0)).unwrap().is_empty());
    assert_eq!(s.position(), PROMPT.len());

    s.reset();
    let out = s.generate(&PROMPT, &GenerationConfig::greedy(2)).unwrap();
    assert_eq!(out.len(), 2);
    // The last generated token is never fed back
    assert_eq!(s.position(), PROMPT.len() + 1);
}

#[test]
fn test_generate_rejects_empty_prompt() {
    let model = tiny();
    let mut s = session(&model, &SessionConfig::default()).unwrap();
    assert!(matches!(
        s.generate(&[], &GenerationConfig::default()),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_generate_propagates_cache_exhausted() {
    let model = open_ended();
    let mut short = session(&model, &SessionConfig::default().with_context_length(4)).unwrap();
    // Prefill fills positions 0..3, the first sample lands at 3, the second has no room
    match short.generate(&PROMPT, &GenerationConfig::greedy(10)) {
        Err(Error::CacheExhausted { position, capacity }) => {
            assert_eq!(position, 4);
            assert_eq!(capacity, 4);
        }
        other => panic!("expected CacheExhausted, got {:?}", other),
    }
}

#[test]
fn test_repetition_penalty_counts_prompt_tokens() {
    let model = open_ended();
    let config = GenerationConfig { repetition_penalty: 10.0, ..GenerationConfig::greedy(1) };
    let mut reordered = 0;
    // Prompt every token but `free`; the context of 16 leaves room to sample once
    for free in 0..16u32 {
        let prompt: Vec<u32> = (0..16).filter(|&t| t != free).collect();
        let mut s = session(&model, &SessionConfig::default()).unwrap();
        let out = s.generate(&prompt, &config).unwrap();

        let mut reference = session(&model, &SessionConfig::default()).unwrap();
        let mut logits = prefill(&mut reference, &prompt);
        let unpenalized = argmax(&logits);
        let mut sampler = LogitsProcessor::from_config(&config);
        sampler.extend_history(&prompt);
        let expected = sampler.sample(&mut logits).unwrap();

        assert_eq!(out, vec![expected], "prompt without token {}", free);
        if expected != unpenalized {
            reordered += 1;
        }
    }
    assert!(reordered > 0, "penalty on prompt tokens never changed the greedy pick");
}

#[test]
fn test_seeded_sampling_is_reproducible() {
    let model = model(&FixtureConfig::small_gqa(QuantKind::F32));
    let config = GenerationConfig {
        max_tokens: 8,
        temperature: 0.9,
        top_k: 10,
        top_p: 0.95,
        seed: 1234,
        ..Default::default()
    };
    let mut a = session(&model, &SessionConfig::default()).unwrap();
    let mut b = session(&model, &SessionConfig::default()).unwrap();
    assert_eq!(
        a.generate(&[2, 5, 7], &config).unwrap(),
        b.generate(&[2, 5, 7], &config).unwrap()
    );
}

#[test]
fn test_mmap_load_matches_in_memory() {
    let bytes = tiny_llama().unwrap();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&bytes).unwrap();
    file.flush().unwrap();

    let mapped = Arc::new(load(file.path()).unwrap());
    let in_memory = Arc::new(load_from_bytes(bytes).unwrap());
    let mut a = session(&mapped, &SessionConfig::default()).unwrap();
    let mut b = session(&in_memory, &SessionConfig::default()).unwrap();
    assert_eq!(prefill(&mut a, &PROMPT), prefill(&mut b, &PROMPT));
}
