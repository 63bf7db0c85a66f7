#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = exam_grader::run().await {
        eprintln!("exam-grader fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
