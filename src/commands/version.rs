pub fn run() {
    println!("kube-spread {}", env!("CARGO_PKG_VERSION"));
}
