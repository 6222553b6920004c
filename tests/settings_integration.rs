use std::io::Write;

use anyhow::Result;
use tempfile::Builder;

use ghproxy::{cli::Cli, cli::LogFormat, settings::Settings};

#[test]
fn loads_settings_file_named_on_command_line() -> Result<()> {
    let mut file = Builder::new().suffix(".toml").tempfile()?;
    writeln!(
        file,
        r#"
host = "127.0.0.1"
port = 9090
jsdelivr = true
chunk_size = 4096
log = "text"
white_list = """
octocat
*/hello
"""
"#
    )?;

    let cli = Cli {
        config: Some(file.path().to_path_buf()),
    };
    let settings = Settings::load(&cli)?;
    assert_eq!(settings.bind_target(), ("127.0.0.1", 9090));
    assert!(settings.jsdelivr);
    assert_eq!(settings.chunk_size, 4096);
    assert_eq!(settings.log, LogFormat::Text);
    assert_eq!(settings.access_policy().white().len(), 2);
    Ok(())
}

#[test]
fn missing_explicit_settings_file_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cli = Cli {
        config: Some(dir.path().join("absent.toml")),
    };
    assert!(Settings::load(&cli).is_err());
}

#[test]
fn invalid_values_abort_loading() -> Result<()> {
    let mut file = Builder::new().suffix(".toml").tempfile()?;
    writeln!(file, "chunk_size = 0")?;
    let cli = Cli {
        config: Some(file.path().to_path_buf()),
    };
    let err = Settings::load(&cli).expect_err("zero chunk size");
    assert!(err.to_string().contains("chunk_size"));
    Ok(())
}
