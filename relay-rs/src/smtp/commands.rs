/// One client line in the command state
///
/// Verbs are matched as case-insensitive prefixes of the trimmed line and
/// arguments are the raw remainder, so `MAIL FROM:<a@b>` and
/// `mail from: <a@b>` both parse, with different remainders.
#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(Option<String>),
    Ehlo(Option<String>),
    MailFrom(String),
    RcptTo(String),
    /// `XCLIENT ADDR=<addr> ...`, sent by front-end proxies
    Xclient(Option<String>),
    Noop,
    Rset,
    Data,
    StartTls,
    /// Initial response (base64 username), if given on the same line
    AuthLogin(Option<String>),
    Quit,
    Unknown(String),
}

/// Strip the surrounding spaces and line terminator
pub fn trim_input(line: &str) -> &str {
    line.trim_matches(|c| c == ' ' || c == '\r' || c == '\n')
}

impl SmtpCommand {
    pub fn parse(input: &str) -> Self {
        let input = trim_input(input);
        let verb = input.to_ascii_uppercase();

        if verb.starts_with("HELO") {
            SmtpCommand::Helo(argument(input, 5))
        } else if verb.starts_with("EHLO") {
            SmtpCommand::Ehlo(argument(input, 5))
        } else if verb.starts_with("MAIL FROM:") {
            SmtpCommand::MailFrom(input[10..].to_string())
        } else if verb.starts_with("XCLIENT") {
            SmtpCommand::Xclient(Self::parse_xclient(input))
        } else if verb.starts_with("RCPT TO:") {
            SmtpCommand::RcptTo(input[8..].to_string())
        } else if verb.starts_with("NOOP") {
            SmtpCommand::Noop
        } else if verb.starts_with("RSET") {
            SmtpCommand::Rset
        } else if verb.starts_with("DATA") {
            SmtpCommand::Data
        } else if verb.starts_with("STARTTLS") {
            SmtpCommand::StartTls
        } else if verb.starts_with("AUTH LOGIN") {
            SmtpCommand::AuthLogin(argument(input, 11))
        } else if verb.starts_with("QUIT") {
            SmtpCommand::Quit
        } else {
            SmtpCommand::Unknown(input.to_string())
        }
    }

    fn parse_xclient(input: &str) -> Option<String> {
        // XCLIENT ADDR=212.96.64.216 NAME=[UNAVAILABLE]
        let rest = input.get(13..)?;
        let addr = rest.split(' ').next().unwrap_or(rest);
        (!addr.is_empty()).then(|| addr.to_string())
    }
}

/// Remainder after `skip` bytes, if any
fn argument(input: &str, skip: usize) -> Option<String> {
    input
        .get(skip..)
        .filter(|rest| !rest.is_empty())
        .map(|rest| rest.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_helo() {
        assert_eq!(
            SmtpCommand::parse("HELO example.com\r\n"),
            SmtpCommand::Helo(Some("example.com".to_string()))
        );
        assert_eq!(SmtpCommand::parse("helo"), SmtpCommand::Helo(None));
    }

    #[test]
    fn test_parse_ehlo() {
        assert_eq!(
            SmtpCommand::parse("ehlo client.example.org"),
            SmtpCommand::Ehlo(Some("client.example.org".to_string()))
        );
    }

    #[test]
    fn test_parse_mail_from_keeps_raw_remainder() {
        assert_eq!(
            SmtpCommand::parse("MAIL FROM:<sender@example.com>\r\n"),
            SmtpCommand::MailFrom("<sender@example.com>".to_string())
        );
        assert_eq!(
            SmtpCommand::parse("Mail From: sender@example.com SIZE=100"),
            SmtpCommand::MailFrom(" sender@example.com SIZE=100".to_string())
        );
        assert_eq!(SmtpCommand::parse("MAIL FROM:"), SmtpCommand::MailFrom(String::new()));
    }

    #[test]
    fn test_parse_rcpt_to() {
        assert_eq!(
            SmtpCommand::parse("rcpt to:<recipient@example.com>"),
            SmtpCommand::RcptTo("<recipient@example.com>".to_string())
        );
    }

    #[test]
    fn test_parse_xclient() {
        assert_eq!(
            SmtpCommand::parse("XCLIENT ADDR=212.96.64.216 NAME=[UNAVAILABLE]"),
            SmtpCommand::Xclient(Some("212.96.64.216".to_string()))
        );
        assert_eq!(
            SmtpCommand::parse("XCLIENT ADDR=10.0.0.1"),
            SmtpCommand::Xclient(Some("10.0.0.1".to_string()))
        );
        assert_eq!(SmtpCommand::parse("XCLIENT"), SmtpCommand::Xclient(None));
    }

    #[test]
    fn test_parse_auth_login() {
        assert_eq!(
            SmtpCommand::parse("AUTH LOGIN YWxpY2U="),
            SmtpCommand::AuthLogin(Some("YWxpY2U=".to_string()))
        );
        assert_eq!(SmtpCommand::parse("auth login"), SmtpCommand::AuthLogin(None));
        // Other mechanisms are not offered
        assert!(matches!(SmtpCommand::parse("AUTH PLAIN AGFsaWNl"), SmtpCommand::Unknown(_)));
    }

    #[test]
    fn test_parse_simple_verbs() {
        assert_eq!(SmtpCommand::parse("DATA"), SmtpCommand::Data);
        assert_eq!(SmtpCommand::parse("noop"), SmtpCommand::Noop);
        assert_eq!(SmtpCommand::parse("RSET"), SmtpCommand::Rset);
        assert_eq!(SmtpCommand::parse("StartTLS"), SmtpCommand::StartTls);
        assert_eq!(SmtpCommand::parse("QUIT"), SmtpCommand::Quit);
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(SmtpCommand::parse("VRFY bob"), SmtpCommand::Unknown("VRFY bob".to_string()));
        assert_eq!(SmtpCommand::parse(""), SmtpCommand::Unknown(String::new()));
        // Non-ASCII input must not split a character
        assert!(matches!(SmtpCommand::parse("HELOé"), SmtpCommand::Helo(None)));
    }
}
