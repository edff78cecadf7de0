//! Occlusion and timer queries, transform feedback objects.

use crate::engine::Engine;
use crate::engine::capabilities::CapabilityFallback;
use crate::engine::constants::BufferUsage;
use crate::engine::resources::{
    BufferContents, BufferHandle, BufferKind, GpuQuery, GpuTransformFeedback, QueryHandle, TransformFeedbackHandle,
};
use crate::gl::GlName;
use crate::gl::consts::{self, GlEnum};

/// Which occlusion test a query runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OcclusionAlgorithm {
    #[default]
    Accurate,
    Conservative,
}

impl OcclusionAlgorithm {
    fn target(self) -> GlEnum {
        match self {
            OcclusionAlgorithm::Accurate => consts::ANY_SAMPLES_PASSED,
            OcclusionAlgorithm::Conservative => consts::ANY_SAMPLES_PASSED_CONSERVATIVE,
        }
    }
}

impl Engine {
    // ── Queries ──────────────────────────────────────────────────────────

    pub fn create_query(&mut self) -> Option<QueryHandle> {
        let mut name = 0;
        if self.can_issue() {
            let Some(n) = self.ctx.create_query() else {
                log::error!("failed to allocate query");
                return None;
            };
            name = n;
        }
        Some(self.queries.insert(GpuQuery { name, active_target: None }))
    }

    pub fn delete_query(&mut self, query: QueryHandle) -> bool {
        let Some(q) = self.queries.remove(query) else {
            return false;
        };
        if q.name != 0 && self.can_issue() {
            if let Some(target) = q.active_target {
                self.ctx.end_query(target);
            }
            self.ctx.delete_query(q.name);
        }
        true
    }

    pub fn query(&self, handle: QueryHandle) -> Option<&GpuQuery> {
        self.queries.get(handle)
    }

    fn begin_query(&mut self, query: QueryHandle, target: GlEnum) -> bool {
        if !self.can_issue() {
            return false;
        }
        let Some(q) = self.queries.get_mut(query) else {
            return false;
        };
        if q.name == 0 || q.active_target.is_some() {
            return false;
        }
        q.active_target = Some(target);
        self.ctx.begin_query(target, q.name);
        true
    }

    fn end_query(&mut self, query: QueryHandle, target: GlEnum) -> bool {
        let Some(q) = self.queries.get_mut(query) else {
            return false;
        };
        if q.active_target != Some(target) {
            return false;
        }
        q.active_target = None;
        if self.can_issue() {
            self.ctx.end_query(target);
        }
        true
    }

    pub fn begin_occlusion_query(&mut self, algorithm: OcclusionAlgorithm, query: QueryHandle) -> bool {
        if !self.caps.occlusion_query {
            return false;
        }
        self.begin_query(query, algorithm.target())
    }

    pub fn end_occlusion_query(&mut self, algorithm: OcclusionAlgorithm, query: QueryHandle) -> bool {
        self.end_query(query, algorithm.target())
    }

    pub fn is_query_result_available(&self, query: QueryHandle) -> bool {
        if !self.can_issue() {
            return false;
        }
        self.queries
            .get(query)
            .is_some_and(|q| q.name != 0 && q.active_target.is_none() && self.ctx.query_result_available(q.name))
    }

    /// Raw result; `None` while pending or after a context loss.
    pub fn get_query_result(&self, query: QueryHandle) -> Option<u64> {
        if !self.is_query_result_available(query) {
            return None;
        }
        self.queries.get(query).map(|q| self.ctx.query_result(q.name))
    }

    /// Start measuring GPU time. `None` when the device has no timer queries.
    pub fn start_time_query(&mut self) -> Option<QueryHandle> {
        if !self.caps.timer_query {
            self.caps.record_fallback(CapabilityFallback::TimerQueryUnavailable);
            return None;
        }
        let query = self.create_query()?;
        if !self.begin_query(query, consts::TIME_ELAPSED_EXT) {
            self.delete_query(query);
            return None;
        }
        Some(query)
    }

    /// Stop a timer query. Returns the elapsed nanoseconds once the result is
    /// available, after which the query is deleted; `None` means poll again.
    pub fn end_time_query(&mut self, query: QueryHandle) -> Option<u64> {
        self.end_query(query, consts::TIME_ELAPSED_EXT);
        let elapsed = self.get_query_result(query)?;
        self.delete_query(query);
        Some(elapsed)
    }

    // ── Transform feedback ───────────────────────────────────────────────

    pub fn create_transform_feedback(&mut self) -> Option<TransformFeedbackHandle> {
        if !self.caps.transform_feedback {
            self.caps.record_fallback(CapabilityFallback::TransformFeedbackUnavailable);
            return None;
        }
        let mut name = 0;
        if self.can_issue() {
            let Some(n) = self.ctx.create_transform_feedback() else {
                log::error!("failed to allocate transform feedback");
                return None;
            };
            name = n;
        }
        Some(self.transform_feedbacks.insert(GpuTransformFeedback { name, buffer: None }))
    }

    pub fn delete_transform_feedback(&mut self, feedback: TransformFeedbackHandle) -> bool {
        let Some(tf) = self.transform_feedbacks.remove(feedback) else {
            return false;
        };
        if self.bound_transform_feedback == Some(feedback) {
            self.bound_transform_feedback = None;
        }
        if tf.name != 0 && self.can_issue() {
            self.ctx.delete_transform_feedback(tf.name);
        }
        true
    }

    pub fn bind_transform_feedback(&mut self, feedback: Option<TransformFeedbackHandle>) {
        let name = feedback.and_then(|h| self.transform_feedbacks.get(h)).map_or(0, |t| t.name);
        self.bound_transform_feedback = feedback.filter(|_| name != 0);
        if self.can_issue() {
            self.ctx.bind_transform_feedback(name);
        }
    }

    pub fn begin_transform_feedback(&mut self, use_points: bool) {
        if self.can_issue() {
            self.ctx.begin_transform_feedback(if use_points { consts::POINTS } else { consts::TRIANGLES });
        }
    }

    pub fn end_transform_feedback(&mut self) {
        if self.can_issue() {
            self.ctx.end_transform_feedback();
        }
    }

    /// Capture target for the bound transform feedback.
    pub fn bind_transform_feedback_buffer(&mut self, buffer: Option<BufferHandle>) {
        if let Some(tf) = self.bound_transform_feedback.and_then(|h| self.transform_feedbacks.get_mut(h)) {
            tf.buffer = buffer;
        }
        if !self.can_issue() {
            return;
        }
        let name = buffer.and_then(|h| self.buffers.get(h)).map_or(0, |b| b.name);
        self.ctx.bind_buffer_base(consts::TRANSFORM_FEEDBACK_BUFFER, 0, name);
    }

    /// Storage-only buffer receiving captured varyings.
    pub fn create_transform_feedback_buffer(&mut self, byte_len: usize) -> Option<BufferHandle> {
        self.create_buffer_internal(
            BufferKind::TransformFeedback,
            BufferUsage::Dynamic,
            BufferContents::Sized(byte_len),
            false,
        )
    }

    /// Declare captured varyings on an unlinked program.
    pub fn set_transform_feedback_varyings(&mut self, program: GlName, varyings: &[String]) {
        if self.can_issue() && self.caps.transform_feedback {
            self.ctx.transform_feedback_varyings(program, varyings, consts::INTERLEAVED_ATTRIBS);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::EngineOptions;
    use crate::engine::Engine;
    use crate::engine::capabilities::CapabilityFallback;
    use crate::gl::{GlCall, HeadlessCapabilities, HeadlessContext};

    use super::OcclusionAlgorithm;

    #[test]
    fn occlusion_query_result_after_end() {
        let (mut engine, _h) = Engine::headless(8, 8, EngineOptions::default()).unwrap();
        let q = engine.create_query().unwrap();
        assert!(engine.begin_occlusion_query(OcclusionAlgorithm::Accurate, q));
        assert!(!engine.begin_occlusion_query(OcclusionAlgorithm::Accurate, q));
        assert!(!engine.is_query_result_available(q));
        assert!(engine.end_occlusion_query(OcclusionAlgorithm::Accurate, q));
        assert!(engine.is_query_result_available(q));
        assert_eq!(engine.get_query_result(q), Some(1));
        assert!(engine.delete_query(q));
        assert!(!engine.delete_query(q));
    }

    #[test]
    fn time_query_deletes_itself_once_read() {
        let (mut engine, _h) = Engine::headless(8, 8, EngineOptions::default()).unwrap();
        let q = engine.start_time_query().unwrap();
        assert!(engine.end_time_query(q).is_some());
        assert!(engine.query(q).is_none());
    }

    #[test]
    fn timer_and_feedback_gated_on_minimal_device() {
        let ctx = HeadlessContext::with_capabilities(8, 8, HeadlessCapabilities::minimal());
        let mut engine = Engine::new(Box::new(ctx), EngineOptions::default()).unwrap();
        assert!(engine.start_time_query().is_none());
        assert!(engine.create_transform_feedback().is_none());
        assert!(engine.get_caps().has_fallback(&CapabilityFallback::TimerQueryUnavailable));
        assert!(engine.get_caps().has_fallback(&CapabilityFallback::TransformFeedbackUnavailable));
    }

    #[test]
    fn feedback_buffer_binds_to_slot_zero() {
        let (mut engine, handle) = Engine::headless(8, 8, EngineOptions::default()).unwrap();
        let tf = engine.create_transform_feedback().unwrap();
        let buffer = engine.create_transform_feedback_buffer(256).unwrap();
        engine.bind_transform_feedback(Some(tf));
        engine.bind_transform_feedback_buffer(Some(buffer));
        engine.begin_transform_feedback(true);
        engine.end_transform_feedback();
        let name = engine.buffer(buffer).unwrap().gl_name();
        assert_eq!(
            handle.count(|c| matches!(c, GlCall::BindBufferBase { index: 0, buffer, .. } if *buffer == name)),
            1
        );
        assert_eq!(handle.count(|c| matches!(c, GlCall::BeginTransformFeedback(_))), 1);
    }
}
