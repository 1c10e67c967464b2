//! Configuração do warmline carregada a partir de `warmline.toml`.
//!
//! A struct [`WarmlineConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis. As variáveis
//! de ambiente `WARMLINE_SERVER_URL` e `WARMLINE_API_KEY` têm precedência
//! sobre o arquivo.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::state_machine::FlowTiming;

/// Configuração de nível superior carregada de `warmline.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct WarmlineConfig {
    /// URL base do servidor CRM.
    #[serde(default)]
    pub server_url: String,

    /// Chave de API para o header Bearer.
    #[serde(default)]
    pub api_key: String,

    /// Intervalo entre ciclos de polling da fila de chamadas, em segundos.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Aceita automaticamente todas as etapas de confirmação.
    #[serde(default)]
    pub auto_accept: bool,

    /// Espera máxima pela primeira chamada atender, em segundos.
    #[serde(default = "default_first_connect_timeout_secs")]
    pub first_connect_timeout_secs: u64,

    /// Duração máxima absoluta de um job, em segundos.
    #[serde(default = "default_overall_timeout_secs")]
    pub overall_timeout_secs: u64,

    /// Janela até o declínio automático de uma confirmação, em segundos.
    #[serde(default = "default_confirm_timeout_secs")]
    pub confirm_timeout_secs: u64,

    /// Tentativas de sondagem da segunda chamada antes de prosseguir.
    #[serde(default = "default_second_poll_attempts")]
    pub second_poll_attempts: u32,
}

// Valor padrão do intervalo de polling: 15s.
fn default_poll_interval_secs() -> u64 {
    15
}

// Valor padrão da espera pela primeira chamada: 60s.
fn default_first_connect_timeout_secs() -> u64 {
    60
}

// Valor padrão do timeout absoluto: 180s.
fn default_overall_timeout_secs() -> u64 {
    180
}

// Valor padrão do declínio automático: 30s.
fn default_confirm_timeout_secs() -> u64 {
    30
}

// Valor padrão do orçamento de sondagem: 30 tentativas.
fn default_second_poll_attempts() -> u32 {
    30
}

impl Default for WarmlineConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            api_key: String::new(),
            poll_interval_secs: default_poll_interval_secs(),
            auto_accept: false,
            first_connect_timeout_secs: default_first_connect_timeout_secs(),
            overall_timeout_secs: default_overall_timeout_secs(),
            confirm_timeout_secs: default_confirm_timeout_secs(),
            second_poll_attempts: default_second_poll_attempts(),
        }
    }
}

impl WarmlineConfig {
    /// Carrega a configuração do caminho fornecido. Usa valores padrão
    /// se o arquivo não existir.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<WarmlineConfig>(&contents)?
        } else {
            Self::default()
        };

        // Variáveis de ambiente têm precedência sobre o arquivo.
        if let Ok(url) = std::env::var("WARMLINE_SERVER_URL")
            && !url.is_empty()
        {
            config.server_url = url;
        }
        if let Ok(key) = std::env::var("WARMLINE_API_KEY")
            && !key.is_empty()
        {
            config.api_key = key;
        }

        config.server_url = config.server_url.trim().to_string();
        // Chaves coladas de dashboards costumam trazer espaços e quebras.
        config.api_key.retain(|c| !c.is_whitespace());

        Ok(config)
    }

    /// Servidor e chave presentes: polling e write-back habilitados.
    pub fn is_configured(&self) -> bool {
        !self.server_url.is_empty() && !self.api_key.is_empty()
    }

    /// Converte os campos configuráveis em um [`FlowTiming`], mantendo os
    /// demais ajustes finos nos defaults.
    pub fn flow_timing(&self) -> FlowTiming {
        FlowTiming {
            first_connect_timeout: Duration::from_secs(self.first_connect_timeout_secs),
            overall_timeout: Duration::from_secs(self.overall_timeout_secs),
            confirm_timeout: Duration::from_secs(self.confirm_timeout_secs),
            second_poll_attempts: self.second_poll_attempts,
            ..FlowTiming::default()
        }
    }
}
