fn main() {
    // Variadic entry points (fprintf, printf, execl*) cannot be defined in
    // stable Rust; a small C file forwards them to the v*/execv* hooks.
    cc::Build::new()
        .file("native/variadic.c")
        .flag_if_supported("-fno-builtin")
        .flag_if_supported("-fvisibility=default")
        .warnings(true)
        .compile("kickmon_variadic");

    println!("cargo:rerun-if-changed=native/variadic.c");
}
