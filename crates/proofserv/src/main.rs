fn main() {
  match proofserv::run() {
    Ok(code) => std::process::exit(code),
    Err(err) => {
      eprintln!("proofserv: {err:#}");
      std::process::exit(1);
    }
  }
}
