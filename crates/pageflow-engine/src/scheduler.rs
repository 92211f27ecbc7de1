//! Batching scheduler.
//!
//! Owns every live sequence from admission to page release. Each step:
//! ingest arrivals, select a prefill/decode batch under the token and page
//! budgets, allocate pages (with rollback), build the batch descriptor, run
//! the model forward, process logits into sampled tokens, evaluate stop
//! criteria, emit deltas, and clean up finished sequences.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info, warn};

use pageflow_core::{
    AttentionKind, FinishReason, RequestId, Sequence, SequenceStatus, TokenId, TOKENS_PER_PAGE,
};
use pageflow_ipc::{ResponseDelta, ResponseWriter};

use crate::batch::BatchDescriptor;
use crate::engine::CancelRegistry;
use crate::logits::apply_processors;
use crate::model::Model;
use crate::pool::PagePool;
use crate::queue::SpscQueue;
use crate::sampler;

/// Sleep when a step finds nothing to do.
const IDLE_SLEEP: Duration = Duration::from_micros(100);

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum concurrently running sequences.
    pub max_num_seqs: usize,
    /// Maximum total tokens per forward step.
    pub max_tokens_in_batch: usize,
    /// Attention mechanism tag forwarded to the backend.
    pub attention: AttentionKind,
    /// Under page exhaustion, evict the newest decode sequence back to
    /// waiting instead of stalling the starved prefill. Off by default.
    pub preempt_decodes: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_seqs: 256,
            max_tokens_in_batch: 4096,
            attention: AttentionKind::Standard,
            preempt_decodes: false,
        }
    }
}

/// One sampled token on its way to the postprocessor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostprocessingData {
    /// Request the token belongs to.
    pub request_id: RequestId,
    /// The sampled token; `None` on token-less terminal deltas.
    pub token_id: Option<TokenId>,
    /// True on the request's last delta.
    pub is_final: bool,
    /// Valid when `is_final`.
    pub finish_reason: FinishReason,
}

/// One entry of a step's admission plan.
struct Admission {
    sequence_id: RequestId,
    chunk: usize,
    is_prefill: bool,
}

/// The scheduling worker (C5). Runs on the engine's main thread.
pub struct Scheduler {
    config: SchedulerConfig,
    pool: Arc<PagePool>,
    model: Box<dyn Model>,
    input: Arc<SpscQueue<Sequence>>,
    postproc: Arc<SpscQueue<PostprocessingData>>,
    response_writer: Arc<ResponseWriter>,
    cancels: CancelRegistry,
    shutdown: Arc<AtomicBool>,

    waiting: VecDeque<Sequence>,
    running: HashMap<RequestId, Sequence>,
    rngs: HashMap<RequestId, StdRng>,
}

impl Scheduler {
    /// Wire the scheduler to its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        pool: Arc<PagePool>,
        model: Box<dyn Model>,
        input: Arc<SpscQueue<Sequence>>,
        postproc: Arc<SpscQueue<PostprocessingData>>,
        response_writer: Arc<ResponseWriter>,
        cancels: CancelRegistry,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            pool,
            model,
            input,
            postproc,
            response_writer,
            cancels,
            shutdown,
            waiting: VecDeque::new(),
            running: HashMap::new(),
            rngs: HashMap::new(),
        }
    }

    /// Main loop; returns once the shutdown flag is set, with every page
    /// returned to the pool.
    pub fn run_loop(&mut self) {
        info!(
            max_num_seqs = self.config.max_num_seqs,
            max_tokens_in_batch = self.config.max_tokens_in_batch,
            "scheduler running"
        );
        while !self.shutdown.load(Ordering::Acquire) {
            if !self.step() {
                std::thread::sleep(IDLE_SLEEP);
            }
        }
        self.drain_on_shutdown();
        info!("scheduler stopped");
    }

    /// Execute one scheduling step. Returns whether any work happened.
    pub fn step(&mut self) -> bool {
        let ingested = self.ingest_new_sequences();
        let admitted = self.admit_waiting();

        let plan = self.select_batch();
        let mut forwarded = false;
        if !plan.is_empty() {
            let batch = self.allocate_and_build(plan);
            if !batch.is_empty() {
                forwarded = true;
                match self.model.forward(&batch) {
                    Ok(logits) if logits.num_rows() == batch.total_tokens => {
                        self.process_output(&batch, &logits);
                    }
                    Ok(logits) => {
                        error!(
                            expected = batch.total_tokens,
                            actual = logits.num_rows(),
                            "backend returned misshapen logits"
                        );
                        self.fail_inflight(&batch);
                    }
                    Err(err) => {
                        error!(%err, "model forward failed");
                        self.fail_inflight(&batch);
                    }
                }
            }
        }

        let cleaned = self.cleanup_finished();
        self.publish_gauges();
        ingested || admitted || forwarded || cleaned
    }

    /// Step 1: pull newly preprocessed sequences into the waiting FIFO.
    fn ingest_new_sequences(&mut self) -> bool {
        let mut any = false;
        while let Some(seq) = self.input.pop() {
            debug!(
                sequence_id = seq.sequence_id,
                prompt_len = seq.prompt_len,
                "sequence arrived"
            );
            self.waiting.push_back(seq);
            any = true;
        }
        any
    }

    /// Move waiting sequences into the running set, oldest first, up to the
    /// concurrency cap. Impossible-fit prompts finish here with MEMORY.
    fn admit_waiting(&mut self) -> bool {
        let mut any = false;
        while self.running.len() < self.config.max_num_seqs {
            let Some(mut seq) = self.waiting.pop_front() else {
                break;
            };
            let id = seq.sequence_id;

            if seq.is_cancelled() {
                self.cancels.remove(id);
                self.emit(PostprocessingData {
                    request_id: id,
                    token_id: None,
                    is_final: true,
                    finish_reason: FinishReason::User,
                });
                continue;
            }

            // A prompt that cannot fit in the whole pool will never run.
            let pages_for_prompt = seq.logical_len().div_ceil(TOKENS_PER_PAGE);
            if pages_for_prompt > self.pool.size() {
                warn!(
                    sequence_id = id,
                    pages_for_prompt,
                    pool = self.pool.size(),
                    "prompt exceeds pool capacity"
                );
                self.cancels.remove(id);
                self.emit(PostprocessingData {
                    request_id: id,
                    token_id: None,
                    is_final: true,
                    finish_reason: FinishReason::Memory,
                });
                continue;
            }

            seq.status = SequenceStatus::Prefilling;
            self.rngs.insert(
                id,
                StdRng::seed_from_u64(u64::from(seq.sampling_params.rng_seed) ^ id),
            );
            self.running.insert(id, seq);
            any = true;
        }
        any
    }

    /// Step 2: pick this step's work under the token and page budgets.
    /// Decode first (they starve fastest), then prefill; oldest arrival
    /// breaks ties.
    fn select_batch(&mut self) -> Vec<Admission> {
        let mut token_budget = self.config.max_tokens_in_batch;
        let mut pages_available = self.pool.num_free();
        let mut plan = Vec::new();

        let mut decode_ids = self.ids_with_status(SequenceStatus::Decoding);
        for id in decode_ids.drain(..) {
            if token_budget == 0 {
                break;
            }
            let seq = &self.running[&id];
            let need = seq.new_pages_for(1);
            if need <= pages_available {
                pages_available -= need;
                token_budget -= 1;
                plan.push(Admission {
                    sequence_id: id,
                    chunk: 1,
                    is_prefill: false,
                });
            }
            // A starved decode stays running and retries next step; pages
            // free as other sequences finish.
        }

        let mut starved_prefill = false;
        let mut prefill_ids = self.ids_with_status(SequenceStatus::Prefilling);
        for id in prefill_ids.drain(..) {
            if token_budget == 0 {
                break;
            }
            let seq = &self.running[&id];
            // A preempted sequence re-prefills its whole context (prompt
            // plus already generated tokens), so the cache target is the
            // logical length, not the prompt length.
            let remaining = seq.logical_len().saturating_sub(seq.prefilled);
            if remaining == 0 {
                continue;
            }
            let mut chunk = remaining.min(token_budget);

            // Shrink the chunk to what the available pages can hold; the
            // rest of the prompt prefills on a later step.
            let holdable =
                (seq.page_table.len() + pages_available) * TOKENS_PER_PAGE - seq.prefilled;
            if holdable == 0 {
                starved_prefill = true;
                continue;
            }
            chunk = chunk.min(holdable);

            let need = seq.new_pages_for(chunk);
            debug_assert!(need <= pages_available);
            pages_available -= need;
            token_budget -= chunk;
            plan.push(Admission {
                sequence_id: id,
                chunk,
                is_prefill: true,
            });
        }

        if starved_prefill && pages_available == 0 && self.config.preempt_decodes {
            if let Some(preempted) = self.preempt_newest_decode() {
                // The freed pages serve the starved prefill next step.
                debug!(sequence_id = preempted, "preempted decode sequence");
            }
        }

        plan
    }

    /// Running sequence ids in `status`, oldest arrival first.
    fn ids_with_status(&self, status: SequenceStatus) -> Vec<RequestId> {
        let mut ids: Vec<(u64, RequestId)> = self
            .running
            .values()
            .filter(|s| s.status == status && !s.is_cancelled())
            .map(|s| (s.arrival_timestamp_ns, s.sequence_id))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Return the newest decode sequence to the waiting FIFO and release its
    /// pages; it will re-prefill from scratch when pages allow.
    fn preempt_newest_decode(&mut self) -> Option<RequestId> {
        let newest = self
            .running
            .values()
            .filter(|s| s.status == SequenceStatus::Decoding)
            .max_by_key(|s| s.arrival_timestamp_ns)
            .map(|s| s.sequence_id)?;
        let mut seq = self.running.remove(&newest)?;
        self.release_pages(&mut seq);
        seq.status = SequenceStatus::Waiting;
        seq.prefilled = 0;
        // The whole context (prompt plus generated) recomputes as prompt.
        self.rngs.remove(&newest);
        self.waiting.push_back(seq);
        Some(newest)
    }

    /// Step 3 + 4: allocate pages per admission (rolling back a sequence on
    /// mid-batch exhaustion) and pack the descriptor.
    fn allocate_and_build(&mut self, plan: Vec<Admission>) -> BatchDescriptor {
        let mut builder = BatchDescriptor::builder(self.config.attention);

        for admission in plan {
            let Some(seq) = self.running.get_mut(&admission.sequence_id) else {
                continue;
            };
            let need = seq.new_pages_for(admission.chunk);
            let mut fresh = Vec::with_capacity(need);
            let mut satisfied = true;
            for _ in 0..need {
                match self.pool.allocate() {
                    Some(page) => fresh.push(page),
                    None => {
                        satisfied = false;
                        break;
                    }
                }
            }
            if !satisfied {
                // Roll back this sequence's allocations and drop it from the
                // batch; it stays running and retries.
                for page in fresh {
                    if let Err(err) = self.pool.release(page) {
                        error!(%err, "rollback release failed");
                    }
                }
                warn!(
                    sequence_id = admission.sequence_id,
                    "pool exhausted mid-batch; sequence deferred"
                );
                continue;
            }
            for page in fresh {
                seq.append_page(page);
            }
            builder.add(seq, admission.chunk, admission.is_prefill);
        }

        builder.build()
    }

    /// Steps 6–8: extract the next-token logit per sequence, process,
    /// sample, evaluate stop criteria, and emit deltas.
    fn process_output(&mut self, batch: &BatchDescriptor, logits: &crate::model::Logits) {
        for i in 0..batch.num_seqs() {
            let id = batch.sequence_ids[i];
            let Some(seq) = self.running.get_mut(&id) else {
                continue;
            };

            seq.prefilled += batch.input_lengths[i];
            if seq.prefilled < seq.logical_len() {
                // A prefill chunk that has not reached the context's end
                // produces no token.
                continue;
            }

            let mut row = logits.row_to_vec(batch.last_row_of(i));
            apply_processors(&mut row, &seq.logits_params, &seq.tokens, seq.prompt_len);

            let rng = self
                .rngs
                .entry(id)
                .or_insert_with(|| StdRng::seed_from_u64(id));
            let token = match sampler::sample(&row, &seq.sampling_params, rng) {
                Ok(token) => token,
                Err(err) => {
                    error!(sequence_id = id, %err, "sampling failed");
                    seq.status = SequenceStatus::Error;
                    self.emit(PostprocessingData {
                        request_id: id,
                        token_id: None,
                        is_final: true,
                        finish_reason: FinishReason::Injection,
                    });
                    continue;
                }
            };

            seq.append_token(token);
            if seq.status == SequenceStatus::Prefilling {
                seq.status = SequenceStatus::Decoding;
            }
            if let Some(m) = pageflow_metrics::metrics() {
                m.tokens_generated.inc();
            }

            // Step 7: stop criteria, in a fixed order.
            let finish = if seq.is_cancelled() {
                Some(FinishReason::User)
            } else if seq.stop_criteria.is_stop_token(token) {
                Some(FinishReason::Stop)
            } else if seq.generation_len() >= seq.stop_criteria.max_generated_tokens {
                Some(FinishReason::Length)
            } else {
                None
            };

            if let Some(reason) = finish {
                seq.status = SequenceStatus::Completed;
                self.emit(PostprocessingData {
                    request_id: id,
                    token_id: Some(token),
                    is_final: true,
                    finish_reason: reason,
                });
            } else {
                self.emit(PostprocessingData {
                    request_id: id,
                    token_id: Some(token),
                    is_final: false,
                    finish_reason: FinishReason::Stop,
                });
            }
        }
    }

    /// The forward pass failed: every sequence in the batch becomes terminal
    /// and its client is told.
    fn fail_inflight(&mut self, batch: &BatchDescriptor) {
        for &id in &batch.sequence_ids {
            if let Some(seq) = self.running.get_mut(&id) {
                seq.status = SequenceStatus::Error;
            }
            self.emit(PostprocessingData {
                request_id: id,
                token_id: None,
                is_final: true,
                finish_reason: FinishReason::Injection,
            });
        }
    }

    /// Step 8: hand a delta to the postprocessor, falling back to a direct
    /// minimal write so no completed sequence is ever lost.
    fn emit(&self, data: PostprocessingData) {
        if let Err(data) = self.postproc.push(data) {
            warn!(
                request_id = data.request_id,
                "postprocessing queue full; writing minimal delta directly"
            );
            let delta = ResponseDelta {
                request_id: data.request_id,
                tokens: data.token_id.into_iter().collect(),
                content: String::new(),
                is_final: data.is_final,
                finish_reason: data.finish_reason,
            };
            if let Err(err) = self.response_writer.write_delta(&delta) {
                error!(request_id = delta.request_id, %err, "direct delta write failed");
            }
        }
    }

    /// Step 9: drop terminal and cancelled sequences, returning their pages.
    fn cleanup_finished(&mut self) -> bool {
        let doomed: Vec<RequestId> = self
            .running
            .values()
            .filter(|s| s.is_finished() || s.is_cancelled())
            .map(|s| s.sequence_id)
            .collect();

        for id in &doomed {
            let Some(mut seq) = self.running.remove(id) else {
                continue;
            };
            if !seq.is_finished() {
                // Cancelled while waiting for its next step.
                seq.status = SequenceStatus::Completed;
                self.emit(PostprocessingData {
                    request_id: *id,
                    token_id: None,
                    is_final: true,
                    finish_reason: FinishReason::User,
                });
            }
            self.release_pages(&mut seq);
            self.rngs.remove(id);
            self.cancels.remove(*id);
            debug!(sequence_id = id, "sequence retired");
        }
        !doomed.is_empty()
    }

    fn release_pages(&self, seq: &mut Sequence) {
        for page in seq.page_table.drain(..) {
            if let Err(err) = self.pool.release(page) {
                error!(page, %err, "page release failed");
            }
        }
    }

    /// On shutdown every live sequence terminates with USER and its pages
    /// return to the pool before the loop exits.
    fn drain_on_shutdown(&mut self) {
        let ids: Vec<RequestId> = self.running.keys().copied().collect();
        for id in ids {
            if let Some(mut seq) = self.running.remove(&id) {
                self.release_pages(&mut seq);
                self.cancels.remove(id);
                self.emit(PostprocessingData {
                    request_id: id,
                    token_id: None,
                    is_final: true,
                    finish_reason: FinishReason::User,
                });
            }
        }
        while let Some(seq) = self.waiting.pop_front() {
            self.cancels.remove(seq.sequence_id);
            self.emit(PostprocessingData {
                request_id: seq.sequence_id,
                token_id: None,
                is_final: true,
                finish_reason: FinishReason::User,
            });
        }
        self.rngs.clear();
    }

    fn publish_gauges(&self) {
        if let Some(m) = pageflow_metrics::metrics() {
            m.free_pages.set(self.pool.num_free() as i64);
            m.running_seqs.set(self.running.len() as i64);
            m.waiting_seqs.set(self.waiting.len() as i64);
        }
    }

    /// Sequences currently running. Observability only.
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Sequences awaiting admission. Observability only.
    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }
}
