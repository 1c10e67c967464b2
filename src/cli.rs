//! Interface de linha de comando do warmline baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, call, demo)
//! e flags globais (--config, --auto-accept, --verbose).

use clap::{Parser, Subcommand};

/// warmline: orquestrador de conferências warm-transfer.
#[derive(Debug, Parser)]
#[command(name = "warmline", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho para o arquivo de configuração TOML.
    #[arg(long, global = true, default_value = "warmline.toml")]
    pub config: String,

    /// Aceita automaticamente todas as etapas de confirmação.
    #[arg(long, global = true, default_value_t = false)]
    pub auto_accept: bool,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Faz polling da fila do CRM e executa os jobs pendentes.
    Run {
        /// Executa no máximo um ciclo de polling e encerra.
        #[arg(long)]
        once: bool,
    },

    /// Executa uma única conferência ad-hoc entre dois números.
    Call {
        /// Número da primeira parte (membro da equipe).
        first: String,
        /// Número da segunda parte (prospect).
        second: String,
    },

    /// Executa a demonstração embutida do fluxo de conferência.
    Demo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_call_subcommand() {
        let cli = Cli::parse_from(["warmline", "call", "+15550100", "+15550199"]);
        match cli.command {
            Command::Call { first, second } => {
                assert_eq!(first, "+15550100");
                assert_eq!(second, "+15550199");
            }
            _ => panic!("expected Call command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "warmline",
            "--auto-accept",
            "--config",
            "custom.toml",
            "--verbose",
            "run",
            "--once",
        ]);
        assert!(cli.auto_accept);
        assert!(cli.verbose);
        assert_eq!(cli.config, "custom.toml");
        assert!(matches!(cli.command, Command::Run { once: true }));
    }

    #[test]
    fn cli_run_defaults_to_continuous_polling() {
        let cli = Cli::parse_from(["warmline", "run"]);
        assert!(matches!(cli.command, Command::Run { once: false }));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
