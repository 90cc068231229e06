//! Sets up OpenHEDZ when the library is loaded into the game.

pub mod hook;
pub mod interop;
pub mod logging;
pub mod memory;
pub mod settings;
pub mod text;

/// Every hook we install, in the order they're applied.
pub fn register_hooks() {
    hook::register(hook_function!(0x00424A20, text::decompress_text));
}

/// Brings everything up. Returns the number of hooks installed.
#[cfg_attr(not(all(windows, target_arch = "x86")), allow(dead_code))]
fn start(options: &settings::Options) -> eyre::Result<usize> {
    log::info!("Cargo package version is {}", env!("CARGO_PKG_VERSION"));
    log::info!("game image base is {:#x}", interop::image_base());

    if !options.install_hooks {
        log::warn!("Hooks are disabled in the options file; leaving the game alone.");
        return Ok(0);
    }

    register_hooks();

    // A failure leaves whichever hooks came before it in place. There's no undoing them.
    let count = hook::init()?;

    Ok(count)
}

#[cfg(all(windows, target_arch = "x86", not(test)))]
#[ctor::ctor]
fn load() {
    let (options, options_err) = settings::Options::load();

    // Logging goes first so that everything after it can log. Without it we carry on silently.
    if let Err(err) = logging::init(&options) {
        eprintln!("openhedz: failed to start logging: {err:?}");
    }

    if let Some(err) = options_err {
        log::error!("Error loading options: {err:?}. Defaults will be used.");
    }

    log::info!("Options: {:#?}", options);

    match start(&options) {
        Ok(count) => echo!("Initialized ({count} hooks)"),
        Err(err) => log::error!("Hook installation failed, OpenHEDZ will not work: {err:?}"),
    }
}

/// An export for the game executable's import table, which is what gets this library loaded.
#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn OpenHEDZ() {}
