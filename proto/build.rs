fn main() {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path().unwrap());
    }
    println!("cargo:rerun-if-changed=./runner.proto");
    tonic_build::compile_protos("./runner.proto")
        .unwrap_or_else(|err| panic!("failed to compile protos: {err:?}"));
}
