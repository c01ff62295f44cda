use std::process::ExitCode;

fn main() -> anyhow::Result<ExitCode> {
    spectrail::init_tracing();
    let code = spectrail::run()?;
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}
