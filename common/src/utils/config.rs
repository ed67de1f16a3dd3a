use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    OpenAI,
    FastEmbed,
    Hashed,
}

fn default_embedding_backend() -> EmbeddingBackend {
    EmbeddingBackend::FastEmbed
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_available_models")]
    pub available_models: Vec<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_use_rerank")]
    pub use_rerank: bool,
    #[serde(default = "default_rerank_top_n")]
    pub rerank_top_n: usize,
    #[serde(default = "default_rerank_pool_size")]
    pub rerank_pool_size: usize,
    #[serde(default = "default_hybrid_weight")]
    pub vector_weight: f32,
    #[serde(default = "default_hybrid_weight")]
    pub lexical_weight: f32,
    #[serde(default = "default_fallback_ratio")]
    pub fallback_ratio: f32,
    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: EmbeddingBackend,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
}

fn default_base_url() -> String {
    "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string()
}

fn default_chat_model() -> String {
    "qwen-plus-latest".to_string()
}

fn default_available_models() -> Vec<String> {
    vec![
        "qwen-max-latest".to_string(),
        "qwen-plus-latest".to_string(),
        "qwen-turbo-latest".to_string(),
    ]
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    8000
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_chunk_size() -> usize {
    600
}

fn default_chunk_overlap() -> usize {
    150
}

fn default_top_k() -> usize {
    8
}

fn default_use_rerank() -> bool {
    true
}

fn default_rerank_top_n() -> usize {
    4
}

fn default_rerank_pool_size() -> usize {
    1
}

fn default_hybrid_weight() -> f32 {
    0.5
}

fn default_fallback_ratio() -> f32 {
    0.5
}

fn default_embedding_dimensions() -> u32 {
    1536
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            openai_base_url: default_base_url(),
            chat_model: default_chat_model(),
            available_models: default_available_models(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            data_dir: default_data_dir(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            top_k: default_top_k(),
            use_rerank: default_use_rerank(),
            rerank_top_n: default_rerank_top_n(),
            rerank_pool_size: default_rerank_pool_size(),
            vector_weight: default_hybrid_weight(),
            lexical_weight: default_hybrid_weight(),
            fallback_ratio: default_fallback_ratio(),
            embedding_backend: default_embedding_backend(),
            embedding_model: None,
            embedding_dimensions: default_embedding_dimensions(),
        }
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
