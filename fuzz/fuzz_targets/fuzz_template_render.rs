#![no_main]

use libfuzzer_sys::fuzz_target;

use chatflow::flows::dispatcher::render_template;
use chatflow::flows::ConversationState;
use chatflow::provider::InboundEvent;

/// Renders arbitrary answer templates.
///
/// Checks that unbalanced or multi-byte input never panics and that text
/// without placeholders passes through unchanged.
fuzz_target!(|data: &[u8]| {
    let Ok(template) = std::str::from_utf8(data) else {
        return;
    };
    let mut state = ConversationState::new("fuzz", 5);
    state.bind("name", "Ana");
    let event = InboundEvent::new("fuzz", "hola");

    let rendered = render_template(template, &state, &event);
    if !template.contains("{{") {
        assert_eq!(rendered, template);
    }
});
