//! Tool schemas and session configuration sent to the realtime model

use serde_json::{Value, json};

use crate::config::RealtimeConfig;

/// Behavioral instructions used when none are configured
pub const DEFAULT_INSTRUCTIONS: &str = "You are the voice of a friendly bartender taking drink \
orders at a busy venue. Keep replies short and conversational. Use the tools to look up drinks, \
check stock, manage the customer's cart and place orders; never invent prices or availability. \
Confirm quantities before placing an order. When the customer says they are done, thank them \
and stop talking.";

/// Instructions for the opening response after connecting
pub const OPENING_INSTRUCTIONS: &str =
    "Greet the customer in one short sentence and ask what they would like.";

/// Response style after an ordering or cart-changing tool
const OUTCOME_FIRST_INSTRUCTIONS: &str = "Tell the customer what was done, in the past tense, \
leading with the outcome. One or two short sentences. Do not repeat the whole cart unless asked.";

/// Response style after an informational tool
const DETAILED_INSTRUCTIONS: &str = "Answer using the details in the tool result. Mention names, \
prices and availability where relevant, then ask if they would like anything else.";

/// How a tool affects the venue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    /// Places or grows an order; gets follow-up filler while pending
    Ordering,
    /// Changes the cart without ordering
    Mutating,
    /// Read-only lookups
    Informational,
}

impl ToolKind {
    /// Classify a tool by name
    ///
    /// Unknown tools are treated as informational.
    #[must_use]
    pub fn classify(name: &str) -> Self {
        match name {
            "add_drink_to_cart" | "process_order" | "update_cart_quantity" => Self::Ordering,
            "remove_drink_from_cart" | "clear_cart" => Self::Mutating,
            _ => Self::Informational,
        }
    }

    /// Whether the tool changes state
    #[must_use]
    pub const fn mutates(self) -> bool {
        matches!(self, Self::Ordering | Self::Mutating)
    }

    /// Style instructions for the response that follows this tool's result
    #[must_use]
    pub const fn response_instructions(self) -> &'static str {
        if self.mutates() {
            OUTCOME_FIRST_INSTRUCTIONS
        } else {
            DETAILED_INSTRUCTIONS
        }
    }
}

fn function(name: &str, description: &str, parameters: Value) -> Value {
    json!({
        "type": "function",
        "name": name,
        "description": description,
        "parameters": parameters,
    })
}

fn no_parameters() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// Function schemas exposed to the model
#[must_use]
pub fn tool_schemas() -> Vec<Value> {
    vec![
        function(
            "search_drinks",
            "Search the drink menu by name, style or ingredient",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "What the customer asked for" },
                    "category": { "type": "string", "description": "Optional category filter" }
                },
                "required": ["query"]
            }),
        ),
        function(
            "get_drink_details",
            "Get price, description and pour sizes for one drink",
            json!({
                "type": "object",
                "properties": { "drink_id": { "type": "string" } },
                "required": ["drink_id"]
            }),
        ),
        function(
            "list_drink_categories",
            "List the drink categories on the menu",
            no_parameters(),
        ),
        function(
            "check_inventory",
            "Check whether a drink is in stock",
            json!({
                "type": "object",
                "properties": { "drink_id": { "type": "string" } },
                "required": ["drink_id"]
            }),
        ),
        function("view_cart", "Show the customer's current cart", no_parameters()),
        function(
            "add_drink_to_cart",
            "Add a drink to the cart",
            json!({
                "type": "object",
                "properties": {
                    "drink_id": { "type": "string" },
                    "quantity": { "type": "integer", "minimum": 1 },
                    "notes": { "type": "string" }
                },
                "required": ["drink_id", "quantity"]
            }),
        ),
        function(
            "remove_drink_from_cart",
            "Remove a drink from the cart",
            json!({
                "type": "object",
                "properties": { "drink_id": { "type": "string" } },
                "required": ["drink_id"]
            }),
        ),
        function(
            "update_cart_quantity",
            "Change the quantity of a drink already in the cart",
            json!({
                "type": "object",
                "properties": {
                    "drink_id": { "type": "string" },
                    "quantity": { "type": "integer", "minimum": 0 }
                },
                "required": ["drink_id", "quantity"]
            }),
        ),
        function("clear_cart", "Remove everything from the cart", no_parameters()),
        function(
            "process_order",
            "Place the order for everything in the cart",
            json!({
                "type": "object",
                "properties": {
                    "payment_method": { "type": "string", "enum": ["card", "cash", "tab"] },
                    "customer_name": { "type": "string" }
                }
            }),
        ),
        function(
            "list_event_packages",
            "List bookable event and party packages",
            no_parameters(),
        ),
        function(
            "get_order_status",
            "Look up the status of a placed order",
            json!({
                "type": "object",
                "properties": { "order_id": { "type": "string" } },
                "required": ["order_id"]
            }),
        ),
    ]
}

/// Body of the session-configuration message
#[must_use]
pub fn session_configuration(config: &RealtimeConfig) -> Value {
    let turn = &config.turn_detection;
    json!({
        "modalities": ["audio", "text"],
        "voice": config.voice,
        "instructions": config.instructions.as_deref().unwrap_or(DEFAULT_INSTRUCTIONS),
        "input_audio_format": "pcm16",
        "output_audio_format": "pcm16",
        "input_audio_transcription": { "model": "whisper-1" },
        "turn_detection": {
            "type": "server_vad",
            "threshold": turn.threshold,
            "prefix_padding_ms": turn.prefix_padding_ms,
            "silence_duration_ms": turn.silence_duration_ms,
        },
        "tools": tool_schemas(),
        "tool_choice": "auto",
    })
}
