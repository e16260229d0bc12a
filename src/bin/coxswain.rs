#[tokio::main]
async fn main() {
    if let Err(err) = coxswain::coxswain().await {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
