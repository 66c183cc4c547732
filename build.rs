// 构建脚本: 链接FFmpeg依赖库
fn main() {
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_RTSP");

    // 仅在启用 rtsp 且 Windows MSVC 环境下添加FFmpeg相关库
    let rtsp = std::env::var_os("CARGO_FEATURE_RTSP").is_some();
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let target_env = std::env::var("CARGO_CFG_TARGET_ENV").unwrap_or_default();
    if !rtsp || target_os != "windows" || target_env != "msvc" {
        return;
    }

    // Intel QSV (Quick Sync Video) 硬件加速
    println!("cargo:rustc-link-lib=dylib=libmfx");

    // OLE 自动化和VFW
    println!("cargo:rustc-link-lib=dylib=oleaut32");
    println!("cargo:rustc-link-lib=dylib=vfw32");

    // Secure Channel (TLS/SSL)
    println!("cargo:rustc-link-lib=dylib=secur32");
}
