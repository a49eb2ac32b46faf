use super::{InferenceSession, Token};
use crate::error::{BridgeError, Result};
use crate::util::utf8::Utf8EmitBuffer;
use tracing::{debug, warn};

/// A prepared session plus the bookkeeping the bridge keeps around it.
pub(crate) struct SessionState<S> {
    pub session: S,
    /// Next KV cache position to write.
    pub position: i32,
    /// Tokens still allowed before the stream ends, if capped.
    pub budget: Option<u32>,
    /// The last decode produced logits that have not been sampled yet.
    pub has_logits: bool,
    pub finished: bool,
    pub utf8: Utf8EmitBuffer,
    n_batch: usize,
}

impl<S: InferenceSession> SessionState<S> {
    pub fn new(session: S, n_batch: usize) -> Self {
        Self {
            session,
            position: 0,
            budget: None,
            has_logits: false,
            finished: false,
            utf8: Utf8EmitBuffer::new(),
            n_batch: n_batch.max(1),
        }
    }

    pub fn n_ctx(&self) -> u32 {
        self.session.n_ctx()
    }

    pub fn n_batch(&self) -> usize {
        self.n_batch
    }

    pub fn is_generating(&self) -> bool {
        self.has_logits && !self.finished
    }

    fn available(&self) -> usize {
        (self.n_ctx() as usize).saturating_sub(self.position.max(0) as usize)
    }

    /// Decode prompt tokens at the current position, `n_batch` at a time,
    /// requesting logits for the final token only.
    pub fn decode_prompt(&mut self, tokens: &[Token]) -> Result<()> {
        let available = self.available();
        if tokens.len() > available {
            return Err(BridgeError::ContextOverflow {
                needed: tokens.len(),
                available,
                n_ctx: self.n_ctx(),
            });
        }

        // A new turn reopens the stream.
        self.finished = false;
        self.utf8.clear();
        if tokens.is_empty() {
            return Ok(());
        }
        self.has_logits = false;

        let last = tokens.len() - 1;
        let mut chunk_start = self.position;
        for (i, &token) in tokens.iter().enumerate() {
            if let Err(e) = self.session.batch_add(token, self.position, i == last) {
                self.rollback(chunk_start);
                return Err(e);
            }
            self.position += 1;

            if self.session.batch_len() >= self.n_batch || i == last {
                self.flush(chunk_start)?;
                chunk_start = self.position;
            }
        }

        self.has_logits = true;
        Ok(())
    }

    /// Sample, feed the sample back through the model, and return its text.
    /// `None` ends the stream.
    pub fn step(&mut self) -> Result<Option<String>> {
        if self.finished {
            return Ok(None);
        }
        if self.budget == Some(0) {
            debug!("Prediction budget exhausted");
            return Ok(self.finish());
        }
        if self.position as u32 >= self.n_ctx() {
            warn!("Context full at {} tokens, ending generation", self.position);
            return Ok(self.finish());
        }
        if !self.has_logits {
            return Err(BridgeError::NoPendingLogits);
        }

        let token = self.session.sample();

        let pos = self.position;
        self.has_logits = false;
        if let Err(e) = self.session.batch_add(token, pos, true) {
            self.rollback(pos);
            return Err(e);
        }
        self.position += 1;
        self.flush(pos)?;
        self.has_logits = true;

        if self.session.is_eog(token) {
            debug!("End of generation token at position {}", pos);
            return Ok(self.finish());
        }

        if let Some(budget) = self.budget.as_mut() {
            *budget -= 1;
        }

        let bytes = self.session.token_piece(token)?;
        Ok(Some(self.utf8.push_and_take_valid(&bytes)))
    }

    /// Forget the conversation: empty KV cache, position zero.
    pub fn reset(&mut self) {
        self.session.clear_batch();
        self.session.clear_kv_cache();
        self.position = 0;
        self.budget = None;
        self.has_logits = false;
        self.finished = false;
        self.utf8.clear();
    }

    fn finish(&mut self) -> Option<String> {
        self.finished = true;
        let rest = self.utf8.flush_lossy();
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }

    fn flush(&mut self, chunk_start: i32) -> Result<()> {
        match self.session.decode() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.rollback(chunk_start);
                Err(e)
            }
        }
    }

    fn rollback(&mut self, chunk_start: i32) {
        self.session.clear_batch();
        self.session.truncate_kv_cache(chunk_start);
        self.position = chunk_start;
        self.has_logits = false;
    }
}
