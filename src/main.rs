use clap::{arg, command, value_parser};
use pe_mapper::pe::PeImage;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

fn main() -> ExitCode {
    let matches = command!()
        .arg(
            arg!(--dump <FILE> "Parse a PE file and pretty-print its headers")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            arg!([pid] "Target process id")
                .value_parser(value_parser!(u32))
                .required_unless_present("dump"),
        )
        .arg(
            arg!([dll] "Path of the DLL to map")
                .value_parser(value_parser!(PathBuf))
                .required_unless_present("dump"),
        )
        .arg(arg!(-e --export <NAME> "Export to invoke after the entry point"))
        .arg(arg!(-v --verbose "Enable debug logging"))
        .get_matches();

    let level = if matches.get_flag("verbose") {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    if let Some(path) = matches.get_one::<PathBuf>("dump") {
        return dump(path);
    }

    let pid = *matches.get_one::<u32>("pid").expect("pid is required");
    let dll = matches.get_one::<PathBuf>("dll").expect("dll is required");
    let export = matches.get_one::<String>("export").map(String::as_str);

    match inject(pid, dll, export) {
        Ok(base) => {
            println!("{} mapped at {base:#x}", dll.display());
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("error: {error}");
            let mut source = std::error::Error::source(&error);
            while let Some(inner) = source {
                eprintln!("  caused by: {inner}");
                source = inner.source();
            }
            ExitCode::FAILURE
        }
    }
}

fn dump(path: &Path) -> ExitCode {
    let binary = match fs::read(path) {
        Ok(binary) => binary,
        Err(error) => {
            eprintln!("error: could not read {}: {error}", path.display());
            return ExitCode::FAILURE;
        }
    };

    match PeImage::parse(&binary) {
        Ok(image) => {
            print!("{image}");
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(windows)]
fn inject(pid: u32, dll: &Path, export: Option<&str>) -> Result<u64, pe_mapper::Error> {
    use pe_mapper::mapper::Mapper;
    use pe_mapper::process::WindowsProcess;

    let process = WindowsProcess::open(pid)?;
    let mut mapper = Mapper::new(process)?;
    mapper.inject_dll(dll, None, export)
}

#[cfg(not(windows))]
fn inject(_pid: u32, _dll: &Path, _export: Option<&str>) -> Result<u64, pe_mapper::Error> {
    eprintln!("pe-mapper can only inject into Windows processes");
    std::process::exit(2);
}
