use ff_like_bot::{Command, parse_command};

#[test]
fn parses_commands_and_arguments() {
    let (cmd, args) = parse_command("/register 12345 Sniper 7", None).unwrap();
    assert_eq!(cmd, Command::Register);
    assert_eq!(args, vec!["12345", "Sniper", "7"]);

    let (cmd, args) = parse_command("/START", None).unwrap();
    assert_eq!(cmd, Command::Start);
    assert!(args.is_empty());

    let (cmd, args) = parse_command("  /like   @bob  ", None).unwrap();
    assert_eq!(cmd, Command::Like);
    assert_eq!(args, vec!["@bob"]);
}

#[test]
fn bot_mentions_are_respected() {
    let (cmd, _) = parse_command("/profile@LikeBot alice", Some("likebot")).unwrap();
    assert_eq!(cmd, Command::Profile);
    assert!(parse_command("/profile@SomeOtherBot alice", Some("LikeBot")).is_none());
    // without a known username any mention is accepted
    assert!(parse_command("/profile@SomeOtherBot", None).is_some());
}

#[test]
fn other_text_is_ignored() {
    assert!(parse_command("hello there", None).is_none());
    assert!(parse_command("/unknown arg", None).is_none());
    assert!(parse_command("", None).is_none());
    assert!(parse_command("like @bob", None).is_none());
}
