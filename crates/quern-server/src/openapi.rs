use quern::protocol::{
    ChatCompletionRequest, ChatCompletionResponse, Choice, FunctionCall, FunctionDefinition,
    HealthResponse, Message, ModelInfo, ModelsListResponse, Role, ToolCall, ToolDefinition, Usage,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        super::routes::chat::chat_completions,
        super::routes::health::health,
        super::routes::models::list_models,
    ),
    components(schemas(
        ChatCompletionRequest,
        ChatCompletionResponse,
        Choice,
        FunctionCall,
        FunctionDefinition,
        HealthResponse,
        Message,
        ModelInfo,
        ModelsListResponse,
        Role,
        ToolCall,
        ToolDefinition,
        Usage,
    ))
)]
pub struct ApiDoc;

pub fn generate_schema() -> String {
    let api_doc = ApiDoc::openapi();
    serde_json::to_string_pretty(&api_doc).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_lists_every_route() {
        let doc: serde_json::Value = serde_json::from_str(&generate_schema()).unwrap();
        let paths = doc["paths"].as_object().unwrap();
        assert!(paths.contains_key("/v1/chat/completions"));
        assert!(paths.contains_key("/health"));
        assert!(paths.contains_key("/v1/models"));
        assert!(doc["components"]["schemas"]["ChatCompletionRequest"].is_object());
    }
}
