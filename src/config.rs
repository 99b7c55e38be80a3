use crate::series::DEFAULT_WINDOW;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;

const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";

// YAML-serializable configuration structure
#[derive(Serialize, Deserialize, Debug)]
pub struct ConfigYaml {
    pub environment: String,
    pub port: u16,
    pub moving_average_window: Option<usize>,
    pub table_tail_rows: Option<usize>,
    pub fetch_rate_limit_per_minute: Option<u32>,
    pub chart_base_url: Option<String>,
    pub quote_base_url: Option<String>,
}

// Holds application-wide settings
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub environment: String,
    pub port: u16,
    pub moving_average_window: usize,
    pub table_tail_rows: usize,
    pub fetch_rate_limit_per_minute: u32,
    pub chart_base_url: String,
    pub quote_base_url: String,
}

impl AppConfig {
    // Load configuration from YAML file or environment variables
    pub fn load() -> Self {
        if let Ok(config_file) = env::var("CONFIG_FILE") {
            Self::from_yaml(&config_file)
        } else {
            Self::from_env()
        }
    }

    // Load configuration from YAML file
    pub fn from_yaml(file_path: &str) -> Self {
        let yaml_content = fs::read_to_string(file_path)
            .unwrap_or_else(|e| panic!("Failed to read config file {}: {}", file_path, e));

        let yaml_config: ConfigYaml = serde_yaml::from_str(&yaml_content)
            .unwrap_or_else(|e| panic!("Failed to parse YAML config: {}", e));

        Self {
            environment: yaml_config.environment,
            port: yaml_config.port,
            moving_average_window: yaml_config.moving_average_window.unwrap_or(DEFAULT_WINDOW),
            table_tail_rows: yaml_config.table_tail_rows.unwrap_or(10),
            fetch_rate_limit_per_minute: yaml_config.fetch_rate_limit_per_minute.unwrap_or(30),
            chart_base_url: yaml_config
                .chart_base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            quote_base_url: yaml_config
                .quote_base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    // Load all configuration from environment variables
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok(); // Load .env file if present

        let environment = env::var("ENVIRONMENT")
            .unwrap_or_else(|_| "development".to_string());

        let port = env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8888);

        let moving_average_window = env::var("MOVING_AVERAGE_WINDOW")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_WINDOW);

        let table_tail_rows = env::var("TABLE_TAIL_ROWS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let fetch_rate_limit_per_minute = env::var("FETCH_RATE_LIMIT_PER_MINUTE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let chart_base_url = env::var("CHART_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        let quote_base_url = env::var("QUOTE_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        Self {
            environment,
            port,
            moving_average_window,
            table_tail_rows,
            fetch_rate_limit_per_minute,
            chart_base_url,
            quote_base_url,
        }
    }
}
