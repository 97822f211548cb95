use std::io::Read;

use lunet_core::value::Value;
use lunet_stdlib::base::display_value;
use lunet_vm::dispatch;
use lunet_vm::vm::Vm;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mut script_file: Option<String> = None;
    let mut exec_statements: Vec<String> = Vec::new();
    let mut interactive = false;
    let mut show_version = false;
    let mut script_args: Vec<String> = Vec::new();
    let mut saw_dashdash = false;

    let mut i = 1;
    while i < args.len() {
        if saw_dashdash {
            script_args.push(args[i].clone());
            i += 1;
            continue;
        }
        match args[i].as_str() {
            "--" => {
                saw_dashdash = true;
                i += 1;
            }
            "-v" => {
                show_version = true;
                i += 1;
            }
            "-i" => {
                interactive = true;
                i += 1;
            }
            "-e" => {
                if i + 1 >= args.len() {
                    eprintln!("lunet: '-e' needs argument");
                    std::process::exit(1);
                }
                exec_statements.push(args[i + 1].clone());
                i += 2;
            }
            _ => {
                if args[i].starts_with('-') && args[i] != "-" {
                    // Combined form like -e"code".
                    if args[i].starts_with("-e") && args[i].len() > 2 {
                        exec_statements.push(args[i][2..].to_string());
                        i += 1;
                    } else {
                        eprintln!("lunet: unrecognized option '{}'", args[i]);
                        std::process::exit(1);
                    }
                } else {
                    script_file = Some(args[i].clone());
                    script_args = args[i + 1..].to_vec();
                    break;
                }
            }
        }
    }

    if show_version {
        println!("Lunet 0.1.0 -- Lua 5.1");
    }

    let stdin_is_tty = atty_check();
    let go_interactive = interactive
        || (script_file.is_none() && exec_statements.is_empty() && stdin_is_tty && !show_version);

    if !exec_statements.is_empty() || script_file.is_some() {
        let mut vm = create_vm(&script_file, &script_args);

        for stat in &exec_statements {
            if let Err(e) = run_bytes(&mut vm, stat.as_bytes(), "=(command line)") {
                eprintln!("lunet: {e}");
                std::process::exit(1);
            }
        }

        if let Some(ref path) = script_file {
            if path == "-" {
                let mut buf = Vec::new();
                if let Err(e) = std::io::stdin().read_to_end(&mut buf) {
                    eprintln!("lunet: cannot read stdin: {e}");
                    std::process::exit(1);
                }
                if let Err(e) = run_bytes(&mut vm, &buf, "=stdin") {
                    eprintln!("lunet: {e}");
                    std::process::exit(1);
                }
            } else {
                let source = match std::fs::read(path) {
                    Ok(data) => data,
                    Err(e) => {
                        eprintln!("lunet: cannot open {path}: {e}");
                        std::process::exit(1);
                    }
                };
                let source = strip_shebang(&source);
                if let Err(e) = run_bytes(&mut vm, source, &format!("@{path}")) {
                    eprintln!("lunet: {e}");
                    std::process::exit(1);
                }
            }
        }

        if go_interactive {
            run_repl(vm);
        }
    } else if !stdin_is_tty && !show_version {
        // Piped input.
        let mut vm = create_vm(&None, &[]);
        let mut buf = Vec::new();
        if let Err(e) = std::io::stdin().read_to_end(&mut buf) {
            eprintln!("lunet: cannot read stdin: {e}");
            std::process::exit(1);
        }
        if let Err(e) = run_bytes(&mut vm, &buf, "=stdin") {
            eprintln!("lunet: {e}");
            std::process::exit(1);
        }
    } else if go_interactive {
        if !show_version {
            println!("Lunet 0.1.0 -- Lua 5.1");
        }
        let vm = create_vm(&None, &[]);
        run_repl(vm);
    }
}

fn create_vm(script_file: &Option<String>, script_args: &[String]) -> Vm {
    let mut vm = Vm::new();

    // Set up the `arg` table the way the reference interpreter does.
    let arg_table = vm.new_table();
    if let Some(path) = script_file {
        let v = vm.new_string(path);
        vm.heap.get_table_mut(arg_table).raw_seti(0, v);
    }
    for (j, a) in script_args.iter().enumerate() {
        let v = vm.new_string(a);
        vm.heap.get_table_mut(arg_table).raw_seti((j + 1) as i64, v);
    }
    let prog = vm.new_string("lunet");
    vm.heap.get_table_mut(arg_table).raw_seti(-1, prog);
    vm.set_global("arg", Value::Table(arg_table));

    vm
}

fn run_bytes(vm: &mut Vm, source: &[u8], name: &str) -> Result<(), String> {
    let chunk = vm.load_chunk(source, name)?;
    match dispatch::call_function(vm, chunk, &[]) {
        Ok(_results) => Ok(()),
        Err(e) => Err(format!("{e}")),
    }
}

fn strip_shebang(source: &[u8]) -> &[u8] {
    if source.starts_with(b"#") {
        match source.iter().position(|&b| b == b'\n') {
            Some(pos) => &source[pos + 1..],
            None => b"",
        }
    } else {
        source
    }
}

fn run_repl(mut vm: Vm) {
    let config = rustyline::config::Config::builder()
        .auto_add_history(true)
        .build();

    let mut rl = match rustyline::DefaultEditor::with_config(config) {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("lunet: cannot initialize REPL: {e}");
            return;
        }
    };

    loop {
        match rl.readline("> ") {
            Ok(line) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }

                // Try as an expression first so `1+2` echoes its value.
                let as_expr = format!("return {line}");
                match try_run(&mut vm, &as_expr) {
                    Ok(Some(output)) => println!("{output}"),
                    Ok(None) => {}
                    Err(_) => {
                        // Run as a statement, reading continuation lines
                        // while the chunk looks unfinished.
                        let mut full = line.clone();
                        loop {
                            match try_run(&mut vm, &full) {
                                Ok(Some(output)) => {
                                    println!("{output}");
                                    break;
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    if e.contains("<eof>") {
                                        match rl.readline(">> ") {
                                            Ok(cont) => {
                                                full.push('\n');
                                                full.push_str(&cont);
                                            }
                                            Err(_) => {
                                                eprintln!("{e}");
                                                break;
                                            }
                                        }
                                    } else {
                                        eprintln!("{e}");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => continue,
            Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("lunet: readline error: {e}");
                break;
            }
        }
    }
}

/// Compile and run one REPL input. `Ok(Some(_))` carries printable
/// results; `Err` carries a compile or runtime message.
fn try_run(vm: &mut Vm, source: &str) -> Result<Option<String>, String> {
    let chunk = vm.load_chunk(source.as_bytes(), "=stdin")?;
    match dispatch::call_function(vm, chunk, &[]) {
        Ok(results) => {
            if results.is_empty() {
                Ok(None)
            } else {
                let parts: Vec<String> = results
                    .iter()
                    .map(|v| display_value(*v, &vm.heap, &vm.strings))
                    .collect();
                Ok(Some(parts.join("\t")))
            }
        }
        Err(e) => Err(format!("{e}")),
    }
}

/// Check if stdin is connected to a terminal.
fn atty_check() -> bool {
    #[cfg(unix)]
    {
        extern "C" {
            fn isatty(fd: i32) -> i32;
        }
        unsafe { isatty(0) != 0 }
    }
    #[cfg(not(unix))]
    {
        true
    }
}
