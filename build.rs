fn main() {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .emit_rerun_if_changed(false)
        .compile_protos(
            &["proto/auth.proto", "proto/userinfo.proto", "proto/follow.proto"],
            &["proto"],
        )
        .unwrap();
}
