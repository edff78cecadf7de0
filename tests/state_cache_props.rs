use node_forge_engine::engine::{AlphaMode, CompareFunction};
use node_forge_engine::gl::GlCall;
use node_forge_engine::{Engine, EngineOptions};
use proptest::prelude::*;

const FUNCS: [CompareFunction; 8] = [
    CompareFunction::Never,
    CompareFunction::Less,
    CompareFunction::Equal,
    CompareFunction::LessOrEqual,
    CompareFunction::Greater,
    CompareFunction::NotEqual,
    CompareFunction::GreaterOrEqual,
    CompareFunction::Always,
];

fn runs<T: PartialEq>(values: &[T]) -> usize {
    values.windows(2).filter(|w| w[0] != w[1]).count() + usize::from(!values.is_empty())
}

proptest! {
    #[test]
    fn depth_func_is_issued_at_most_once_per_run(seq in prop::collection::vec((0usize..8, 1usize..4), 1..24)) {
        let (mut engine, gl) = Engine::headless(8, 8, EngineOptions::default()).unwrap();
        engine.apply_states();
        gl.clear_calls();

        let mut issued = Vec::new();
        for (index, repeat) in seq {
            for _ in 0..repeat {
                engine.set_depth_function(FUNCS[index]);
                engine.apply_states();
                issued.push(index);
            }
        }
        let calls = gl.count(|c| matches!(c, GlCall::DepthFunc(_)));
        prop_assert!(calls <= runs(&issued));
    }

    #[test]
    fn stencil_mask_repeats_are_free(masks in prop::collection::vec(0u32..4, 1..32)) {
        let (mut engine, gl) = Engine::headless(8, 8, EngineOptions::default()).unwrap();
        engine.apply_states();
        gl.clear_calls();
        for &mask in &masks {
            engine.set_stencil_mask(mask);
            engine.set_stencil_mask(mask);
            engine.apply_states();
        }
        let calls = gl.count(|c| matches!(c, GlCall::StencilMask(_)));
        prop_assert!(calls <= runs(&masks));
    }
}

#[test]
fn alpha_mode_toggle_sends_blend_state_once() {
    let (mut engine, gl) = Engine::headless(8, 8, EngineOptions::default()).unwrap();
    engine.apply_states();
    gl.clear_calls();
    for _ in 0..5 {
        engine.set_alpha_mode(AlphaMode::Combine, false);
        engine.apply_states();
    }
    assert_eq!(gl.count(|c| matches!(c, GlCall::BlendFuncSeparate(_))), 1);
    assert_eq!(engine.get_alpha_mode(), AlphaMode::Combine);
}

#[test]
fn wiped_cache_reissues_state() {
    let (mut engine, gl) = Engine::headless(8, 8, EngineOptions::default()).unwrap();
    engine.set_depth_function_to_greater();
    engine.apply_states();
    engine.wipe_caches(true);
    gl.clear_calls();
    engine.set_depth_function_to_greater();
    engine.apply_states();
    assert_eq!(gl.count(|c| matches!(c, GlCall::DepthFunc(_))), 1);
}
