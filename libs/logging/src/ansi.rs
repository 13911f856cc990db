/// Whether stdout supports ANSI color escapes, honouring `NO_COLOR`/`CLICOLOR_FORCE`
/// the same way `supports-color` does.
pub fn stdout_supports_ansi() -> bool {
    supports_color::on(supports_color::Stream::Stdout).is_some()
}
