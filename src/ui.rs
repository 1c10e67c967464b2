//! Interface de terminal do warmline: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`FlowProgress`] acompanha visualmente a
//! execução de uma conferência no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::state_machine::{ConferenceOutcome, FlowReport, JobStatus};

/// Indicador visual de progresso para um fluxo de conferência no terminal.
///
/// Exibe um spinner animado durante o fluxo e mensagens coloridas para
/// sucesso (verde) e falha (vermelho).
pub struct FlowProgress {
    // Barra de progresso/spinner do indicatif.
    pb: ProgressBar,
    // Estilo verde para mensagens de sucesso.
    green: Style,
    // Estilo vermelho para mensagens de falha.
    red: Style,
    // Estilo amarelo para estados intermediários.
    yellow: Style,
}

impl FlowProgress {
    /// Inicia o spinner com o rótulo do job e retorna a instância.
    pub fn start(label: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .expect("invalid template"),
        );
        pb.set_message(label.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Espelha o status ao vivo no spinner até o emissor encerrar.
    pub fn follow(&self, mut status: watch::Receiver<String>) -> JoinHandle<()> {
        let pb = self.pb.clone();
        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                pb.set_message(status.borrow_and_update().clone());
            }
        })
    }

    /// Finaliza o spinner e exibe o resultado final do fluxo.
    ///
    /// Sucesso é mostrado em verde com checkmark; falha em vermelho com X.
    pub fn complete(&self, outcome: &ConferenceOutcome) {
        self.pb.finish_and_clear();
        match outcome {
            ConferenceOutcome::Completed => {
                println!("  {} Conference flow completed", self.green.apply_to("✓"));
            }
            ConferenceOutcome::Failed(reason) => {
                println!(
                    "  {} Conference flow failed: {reason}",
                    self.red.apply_to("✗")
                );
            }
        }
    }

    /// Imprime o relatório do fluxo formatado em JSON com estilo colorido.
    pub fn print_report(&self, report: &FlowReport) {
        let status_style = match report.status {
            JobStatus::Completed => &self.green,
            JobStatus::Failed => &self.red,
            _ => &self.yellow,
        };
        println!();
        println!("{}", status_style.apply_to("─── Flow Report ───"));
        println!(
            "{}",
            serde_json::to_string_pretty(report).unwrap_or_default()
        );
    }
}
