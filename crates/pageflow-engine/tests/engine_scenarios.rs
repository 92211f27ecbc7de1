//! End-to-end scenarios over the full pipeline: real shared-memory rings,
//! all four workers, a scripted model backend, and a byte-level codec.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pageflow_core::{EngineConfig, FinishReason, SamplingParams, StopCriteria};
use pageflow_engine::{BatchDescriptor, Engine, Logits, Model, ModelError, PagePool};
use pageflow_ipc::{IpcConfig, RequestWriter, ResponseDelta, ResponseReader, SubmitRequest};
use pageflow_tokenizer::{TextCodec, TokenizerError};

/// Codec that maps bytes to token ids one-to-one.
struct ByteCodec;

impl TextCodec for ByteCodec {
    fn encode(&self, text: &str) -> Result<Vec<i32>, TokenizerError> {
        Ok(text.bytes().map(i32::from).collect())
    }

    fn decode(&self, tokens: &[i32]) -> Result<String, TokenizerError> {
        let bytes: Vec<u8> = tokens
            .iter()
            .map(|&t| u8::try_from(t).map_err(|_| TokenizerError::Decode(format!("token {t}"))))
            .collect::<Result<_, _>>()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Backend whose every logit row favors one fixed token.
struct ScriptedModel {
    vocab: usize,
    favorite: i32,
}

impl Model for ScriptedModel {
    fn forward(&mut self, batch: &BatchDescriptor) -> Result<Logits, ModelError> {
        let mut data = vec![0.0f32; batch.total_tokens * self.vocab];
        for row in 0..batch.total_tokens {
            data[row * self.vocab + self.favorite as usize] = 10.0;
        }
        Logits::new(data, self.vocab)
    }

    fn num_layers(&self) -> usize {
        2
    }
    fn num_kv_heads(&self) -> usize {
        2
    }
    fn head_dim(&self) -> usize {
        8
    }
    fn vocab_size(&self) -> usize {
        self.vocab
    }
}

struct Harness {
    ipc_config: IpcConfig,
    writer: RequestWriter,
    reader: ResponseReader,
    pool: Arc<PagePool>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    cancels: pageflow_engine::CancelRegistry,
    engine_thread: Option<std::thread::JoinHandle<()>>,
}

impl Harness {
    fn start(tag: &str, favorite: i32, num_kv_pages: usize) -> Self {
        let ipc_config =
            IpcConfig::with_suffix(&format!("e2e_{}_{}", tag, std::process::id()));
        let engine_config = EngineConfig {
            model_path: "/dev/null".into(),
            num_kv_pages,
            max_num_seqs: 8,
            max_tokens_in_batch: 512,
            ..Default::default()
        };

        let model = Box::new(ScriptedModel {
            vocab: 300,
            favorite,
        });
        let engine = Engine::new(
            engine_config,
            ipc_config.clone(),
            model,
            Arc::new(ByteCodec),
        )
        .unwrap();

        let shutdown = engine.shutdown_flag();
        let cancels = engine.cancels();
        let pool = engine.pool();

        // Workers come up inside run_blocking; the rings already exist, so
        // the client can connect immediately.
        let writer = RequestWriter::open(&ipc_config, None).unwrap();
        let reader = ResponseReader::open(&ipc_config).unwrap();

        let engine_thread = std::thread::spawn(move || {
            engine.run_blocking().unwrap();
        });

        Self {
            ipc_config,
            writer,
            reader,
            pool,
            shutdown,
            cancels,
            engine_thread: Some(engine_thread),
        }
    }

    /// Read deltas for `request_id` until its final delta arrives.
    fn collect_request(&self, request_id: u64, timeout: Duration) -> Vec<ResponseDelta> {
        let deadline = Instant::now() + timeout;
        let mut deltas = Vec::new();
        while Instant::now() < deadline {
            if let Some(delta) = self.reader.next_delta(Duration::from_millis(50)) {
                if delta.request_id != request_id {
                    continue;
                }
                let done = delta.is_final;
                deltas.push(delta);
                if done {
                    return deltas;
                }
            }
        }
        panic!("no final delta for request {request_id} within {timeout:?}");
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.engine_thread.take() {
            handle.join().unwrap();
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.engine_thread.take() {
            let _ = handle.join();
        }
    }
}

fn greedy_request(request_id: u64, prompt: &str, stop: Vec<i32>, max: usize) -> SubmitRequest {
    let mut request = SubmitRequest::completion(request_id, prompt);
    request.sampling_params = SamplingParams::greedy();
    request.stop_criteria = StopCriteria {
        max_generated_tokens: max,
        stop_token_ids: stop.into_iter().collect(),
    };
    request
}

#[test]
fn test_single_prompt_greedy_stop() {
    // S1: greedy generation ends on the stop token; pool fully restored.
    let mut harness = Harness::start("s1", 42, 16);

    harness
        .writer
        .submit(&greedy_request(1, "abc", vec![42], 100))
        .unwrap();

    let deltas = harness.collect_request(1, Duration::from_secs(10));
    assert_eq!(deltas.len(), 1);
    let last = deltas.last().unwrap();
    assert!(last.is_final);
    assert_eq!(last.finish_reason, FinishReason::Stop);
    assert_eq!(last.tokens, vec![42]);
    // Byte 42 is '*'.
    assert_eq!(last.content, "*");

    // Every delta carries exactly one token; their count is the generation
    // length.
    assert!(deltas.iter().all(|d| d.tokens.len() == 1));

    // Pages return once cleanup runs.
    let deadline = Instant::now() + Duration::from_secs(5);
    while harness.pool.num_free() != 16 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(harness.pool.num_free(), 16);
    harness.stop();
}

#[test]
fn test_length_cap() {
    // S2: five deltas exactly, the last finishing with LENGTH.
    let mut harness = Harness::start("s2", 65, 16);

    harness
        .writer
        .submit(&greedy_request(2, "abc", vec![], 5))
        .unwrap();

    let deltas = harness.collect_request(2, Duration::from_secs(10));
    assert_eq!(deltas.len(), 5);
    for delta in &deltas[..4] {
        assert!(!delta.is_final);
        assert_eq!(delta.tokens, vec![65]);
        assert_eq!(delta.content, "A");
    }
    assert_eq!(deltas[4].finish_reason, FinishReason::Length);
    harness.stop();
}

#[test]
fn test_pool_pressure_rejects_oversized_prompt() {
    // S3: a 200-token prompt cannot fit in a 2-page pool.
    let mut harness = Harness::start("s3", 65, 2);

    let prompt = "x".repeat(200);
    harness
        .writer
        .submit(&greedy_request(3, &prompt, vec![], 100))
        .unwrap();

    let deltas = harness.collect_request(3, Duration::from_secs(10));
    assert_eq!(deltas.len(), 1);
    assert!(deltas[0].tokens.is_empty());
    assert_eq!(deltas[0].finish_reason, FinishReason::Memory);
    assert_eq!(harness.pool.num_free(), 2);
    harness.stop();
}

#[test]
fn test_concurrent_producers_all_resolve() {
    // S4 (scaled down): every submitted request gets a final delta or a
    // logged drop; finals plus drops equal submissions.
    const PRODUCERS: u64 = 8;
    const PER_PRODUCER: u64 = 25;

    let mut harness = Harness::start("s4", 42, 64);

    let mut producer_threads = Vec::new();
    for t in 0..PRODUCERS {
        let config = harness.ipc_config.clone();
        producer_threads.push(std::thread::spawn(move || {
            let writer = RequestWriter::open(&config, None).unwrap();
            let mut submitted = 0u64;
            for i in 0..PER_PRODUCER {
                let id = 1000 + t * PER_PRODUCER + i;
                if writer
                    .submit(&greedy_request(id, "hi", vec![42], 50))
                    .is_ok()
                {
                    submitted += 1;
                }
            }
            submitted
        }));
    }

    let submitted: u64 = producer_threads
        .into_iter()
        .map(|h| h.join().unwrap())
        .sum();
    assert_eq!(submitted, PRODUCERS * PER_PRODUCER);

    let mut finals = std::collections::HashSet::new();
    let deadline = Instant::now() + Duration::from_secs(30);
    while (finals.len() as u64) < submitted && Instant::now() < deadline {
        if let Some(delta) = harness.reader.next_delta(Duration::from_millis(100)) {
            if delta.is_final {
                assert!(finals.insert(delta.request_id), "duplicate final delta");
            }
        }
    }
    assert_eq!(finals.len() as u64, submitted);
    harness.stop();
}

#[test]
fn test_cancellation_mid_decode() {
    // S5: cancel after a few deltas; the next delta is final with USER and
    // the pool drains back to full.
    let mut harness = Harness::start("s5", 65, 16);

    harness
        .writer
        .submit(&greedy_request(5, "abc", vec![], 100_000))
        .unwrap();

    let mut seen = 0;
    let deadline = Instant::now() + Duration::from_secs(10);
    while seen < 5 && Instant::now() < deadline {
        if let Some(delta) = harness.reader.next_delta(Duration::from_millis(50)) {
            assert!(!delta.is_final);
            seen += 1;
        }
    }
    assert_eq!(seen, 5);

    assert!(harness.cancels.cancel(5));

    let deadline = Instant::now() + Duration::from_secs(10);
    let finish = loop {
        assert!(Instant::now() < deadline, "no final delta after cancel");
        if let Some(delta) = harness.reader.next_delta(Duration::from_millis(50)) {
            if delta.is_final {
                break delta.finish_reason;
            }
        }
    };
    assert_eq!(finish, FinishReason::User);

    let deadline = Instant::now() + Duration::from_secs(5);
    while harness.pool.num_free() != 16 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(harness.pool.num_free(), 16);
    harness.stop();
}

#[test]
fn test_shutdown_under_load() {
    // S6: with work in flight, shutdown completes in finite time and every
    // page returns to the pool first.
    let mut harness = Harness::start("s6", 65, 32);

    for id in 0..10u64 {
        harness
            .writer
            .submit(&greedy_request(id, "abcdef", vec![], 1_000_000))
            .unwrap();
    }

    // Let generation get going.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut seen = 0;
    while seen < 10 && Instant::now() < deadline {
        if harness.reader.next_delta(Duration::from_millis(50)).is_some() {
            seen += 1;
        }
    }
    assert!(seen > 0, "engine produced nothing before shutdown");

    harness.stop();
    assert_eq!(harness.pool.num_free(), 32);

    // In-flight requests were finalized on the way out.
    let mut finals = 0;
    while let Some(delta) = harness.reader.try_next() {
        if delta.is_final {
            assert_eq!(delta.finish_reason, FinishReason::User);
            finals += 1;
        }
    }
    assert!(finals > 0, "no terminal deltas after shutdown");
}

/// Backend whose logit row at a given position favors the token equal to
/// that position's context length, making generation order observable.
struct CountingModel {
    vocab: usize,
}

impl Model for CountingModel {
    fn forward(&mut self, batch: &BatchDescriptor) -> Result<Logits, ModelError> {
        let mut data = vec![0.0f32; batch.total_tokens * self.vocab];
        let mut row = 0;
        for i in 0..batch.sequence_ids.len() {
            for offset in 0..batch.input_lengths[i] {
                let position = batch.context_lengths[i] + offset;
                let favorite = (position + 1) % self.vocab;
                data[row * self.vocab + favorite] = 10.0;
                row += 1;
            }
        }
        Logits::new(data, self.vocab)
    }

    fn num_layers(&self) -> usize {
        2
    }
    fn num_kv_heads(&self) -> usize {
        2
    }
    fn head_dim(&self) -> usize {
        8
    }
    fn vocab_size(&self) -> usize {
        self.vocab
    }
}

#[test]
fn test_deltas_arrive_in_generation_order() {
    // Per-request ordering: with a backend that samples its own context
    // length, the client must observe strictly increasing token values.
    let ipc_config = IpcConfig::with_suffix(&format!("order_{}", std::process::id()));
    let engine_config = EngineConfig {
        model_path: "/dev/null".into(),
        num_kv_pages: 16,
        max_num_seqs: 4,
        max_tokens_in_batch: 128,
        ..Default::default()
    };
    let engine = Engine::new(
        engine_config,
        ipc_config.clone(),
        Box::new(CountingModel { vocab: 300 }),
        Arc::new(ByteCodec),
    )
    .unwrap();
    let shutdown = engine.shutdown_flag();
    let writer = RequestWriter::open(&ipc_config, None).unwrap();
    let reader = ResponseReader::open(&ipc_config).unwrap();
    let engine_thread = std::thread::spawn(move || engine.run_blocking().unwrap());

    // Prompt of 3 bytes; decode then counts 3, 4, 5, ...
    writer
        .submit(&greedy_request(77, "abc", vec![], 8))
        .unwrap();

    let mut tokens = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        assert!(Instant::now() < deadline, "generation stalled");
        if let Some(delta) = reader.next_delta(Duration::from_millis(50)) {
            tokens.extend(delta.tokens);
            if delta.is_final {
                break;
            }
        }
    }
    assert_eq!(tokens, vec![3, 4, 5, 6, 7, 8, 9, 10]);

    shutdown.store(true, Ordering::Release);
    engine_thread.join().unwrap();
}

#[test]
fn test_empty_prompt_rejected_with_terminal_delta() {
    // A prompt that tokenizes to nothing is dropped with a terminal delta
    // rather than hanging the client.
    let mut harness = Harness::start("reject", 42, 16);

    harness
        .writer
        .submit(&greedy_request(7, "", vec![], 10))
        .unwrap();

    let deltas = harness.collect_request(7, Duration::from_secs(10));
    assert_eq!(deltas.len(), 1);
    assert!(deltas[0].tokens.is_empty());
    assert_eq!(deltas[0].finish_reason, FinishReason::Injection);
    harness.stop();
}
