//! The built-in unit registry.
//!
//! Units are looked up by name; each entry wires the unit's command line
//! and provides a factory. The registry is a static table of factories,
//! so adding a unit means adding one entry here.

pub mod codecs;
pub mod crypto;
pub mod frame_ops;
pub mod strings;
pub mod vars;

use crate::error::Result;
use crate::unit::{multibin_all, multibin_opt, multibin_req, Unit, UnitSpec};
use clap::{Arg, ArgAction};

fn positional(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name).help(help).allow_hyphen_values(true)
}

/// All built-in units, sorted by name
pub static REGISTRY: &[UnitSpec] = &[
    UnitSpec {
        name: "aes",
        about: "AES decryption (CBC or ECB, PKCS#7); -R encrypts",
        reversible: true,
        frame_aware: false,
        configure: |c| {
            c.arg(positional("key", "key as a multibin expression").required(true))
                .arg(
                    Arg::new("iv")
                        .long("iv")
                        .help("initialization vector; all zero when omitted")
                        .allow_hyphen_values(true),
                )
                .arg(
                    Arg::new("mode")
                        .long("mode")
                        .default_value("cbc")
                        .help("cipher mode: cbc or ecb"),
                )
        },
        build: |m| {
            let key = multibin_req(m, "key")?;
            let iv = multibin_opt(m, "iv")?;
            let mode = crypto::CipherMode::parse(
                m.get_one::<String>("mode").map(String::as_str).unwrap_or("cbc"),
            )?;
            Ok(Box::new(crypto::Aes::new(key, iv, mode)))
        },
    },
    UnitSpec {
        name: "b64",
        about: "base64 decoding; -R encodes",
        reversible: true,
        frame_aware: false,
        configure: |c| c,
        build: |_| Ok(Box::new(codecs::ByteCodec::b64())),
    },
    UnitSpec {
        name: "b85",
        about: "base85 decoding; -R encodes",
        reversible: true,
        frame_aware: false,
        configure: |c| c,
        build: |_| Ok(Box::new(codecs::ByteCodec::b85())),
    },
    UnitSpec {
        name: "cca",
        about: "append data to every chunk; -R strips it",
        reversible: true,
        frame_aware: false,
        configure: |c| c.arg(positional("data", "data to append").required(true)),
        build: |m| Ok(Box::new(strings::Affix::append(multibin_req(m, "data")?))),
    },
    UnitSpec {
        name: "ccp",
        about: "prepend data to every chunk; -R strips it",
        reversible: true,
        frame_aware: false,
        configure: |c| c.arg(positional("data", "data to prepend").required(true)),
        build: |m| Ok(Box::new(strings::Affix::prepend(multibin_req(m, "data")?))),
    },
    UnitSpec {
        name: "cfmt",
        about: "format chunks; {} is the payload, {name} a meta variable",
        reversible: false,
        frame_aware: false,
        configure: |c| c.arg(positional("format", "format string").required(true)),
        build: |m| {
            let format = m.get_one::<String>("format").expect("required");
            Ok(Box::new(vars::Cfmt::new(format)?))
        },
    },
    UnitSpec {
        name: "chop",
        about: "chop the payload into blocks of a fixed size",
        reversible: false,
        frame_aware: false,
        configure: |c| c.arg(positional("size", "block size in bytes").required(true)),
        build: |m| Ok(Box::new(strings::Chop::new(multibin_req(m, "size")?))),
    },
    UnitSpec {
        name: "dedup",
        about: "drop duplicate chunks within each frame",
        reversible: false,
        frame_aware: true,
        configure: |c| c,
        build: |_| Ok(Box::new(frame_ops::Dedup)),
    },
    UnitSpec {
        name: "emit",
        about: "emit one chunk per argument, discarding input payloads",
        reversible: false,
        frame_aware: false,
        configure: |c| {
            c.arg(
                positional("data", "data to emit")
                    .action(ArgAction::Append)
                    .num_args(1..),
            )
        },
        build: |m| Ok(Box::new(strings::Emit::new(multibin_all(m, "data")?))),
    },
    UnitSpec {
        name: "esc",
        about: "decode backslash escape sequences; -R escapes",
        reversible: true,
        frame_aware: false,
        configure: |c| c,
        build: |_| Ok(Box::new(codecs::ByteCodec::esc())),
    },
    UnitSpec {
        name: "hex",
        about: "hexadecimal decoding; -R encodes",
        reversible: true,
        frame_aware: false,
        configure: |c| c,
        build: |_| Ok(Box::new(codecs::ByteCodec::hex())),
    },
    UnitSpec {
        name: "nop",
        about: "forward chunks unchanged",
        reversible: false,
        frame_aware: false,
        configure: |c| c,
        build: |_| Ok(Box::new(strings::Nop)),
    },
    UnitSpec {
        name: "pack",
        about: "parse numbers from text and pack them as bytes; -R unpacks",
        reversible: true,
        frame_aware: false,
        configure: |c| {
            c.arg(
                Arg::new("base")
                    .help("numeral base; 0 accepts decimal and 0x-prefixed hex")
                    .value_parser(clap::value_parser!(u32))
                    .default_value("0"),
            )
        },
        build: |m| {
            let base = *m.get_one::<u32>("base").expect("defaulted");
            Ok(Box::new(codecs::Pack::new(base)?))
        },
    },
    UnitSpec {
        name: "put",
        about: "bind a meta variable on every chunk",
        reversible: false,
        frame_aware: false,
        configure: |c| {
            c.arg(positional("name", "variable name").required(true))
                .arg(positional("value", "value; the payload when omitted"))
        },
        build: |m| {
            let name = m.get_one::<String>("name").expect("required").clone();
            let value = m.get_one::<String>("value").cloned();
            Ok(Box::new(vars::Put::new(name, value)?))
        },
    },
    UnitSpec {
        name: "resplit",
        about: "split the payload on a byte pattern, line breaks by default",
        reversible: false,
        frame_aware: false,
        configure: |c| c.arg(positional("pattern", "split pattern").default_value("\\n")),
        build: |m| Ok(Box::new(strings::Resplit::new(multibin_req(m, "pattern")?))),
    },
    UnitSpec {
        name: "rev",
        about: "reverse the payload byte order",
        reversible: true,
        frame_aware: false,
        configure: |c| c,
        build: |_| Ok(Box::new(strings::Rev)),
    },
    UnitSpec {
        name: "scope",
        about: "limit visibility to the chunks at the given frame indices",
        reversible: false,
        frame_aware: false,
        configure: |c| {
            c.arg(
                positional("slice", "frame indices or S:E ranges")
                    .action(ArgAction::Append)
                    .num_args(1..)
                    .required(true),
            )
        },
        build: |m| {
            let specs = m
                .get_many::<String>("slice")
                .expect("required")
                .cloned()
                .collect();
            Ok(Box::new(strings::Scope::new(specs)?))
        },
    },
    UnitSpec {
        name: "sep",
        about: "insert a separator between the chunks of every frame",
        reversible: false,
        frame_aware: false,
        configure: |c| c.arg(positional("data", "separator data").default_value("\\n")),
        build: |m| Ok(Box::new(strings::Sep::new(multibin_req(m, "data")?))),
    },
    UnitSpec {
        name: "snip",
        about: "emit one chunk per payload slice",
        reversible: false,
        frame_aware: false,
        configure: |c| {
            c.arg(
                positional("slice", "S:E slices of the payload")
                    .action(ArgAction::Append)
                    .num_args(1..)
                    .required(true),
            )
        },
        build: |m| {
            let slices = m
                .get_many::<String>("slice")
                .expect("required")
                .cloned()
                .collect();
            Ok(Box::new(strings::Snip::new(slices)))
        },
    },
    UnitSpec {
        name: "sorted",
        about: "sort the chunks of every frame by payload",
        reversible: false,
        frame_aware: true,
        configure: |c| c,
        build: |_| Ok(Box::new(frame_ops::Sorted)),
    },
    UnitSpec {
        name: "url",
        about: "percent-decoding; -R encodes",
        reversible: true,
        frame_aware: false,
        configure: |c| c,
        build: |_| Ok(Box::new(codecs::ByteCodec::url())),
    },
    UnitSpec {
        name: "zl",
        about: "zlib decompression; -R compresses",
        reversible: true,
        frame_aware: false,
        configure: |c| c,
        build: |_| Ok(Box::new(codecs::Zl)),
    },
];

/// Looks up a unit by name
pub fn find(name: &str) -> Option<&'static UnitSpec> {
    REGISTRY.iter().find(|spec| spec.name == name)
}

/// Builds a unit instance directly from an argv slice, the first token
/// being the unit name
pub fn instantiate(tokens: &[String]) -> Result<(&'static UnitSpec, Box<dyn Unit>, crate::unit::UnitOpts)> {
    let (name, rest) = tokens
        .split_first()
        .ok_or_else(|| crate::error::Error::argument("missing unit name"))?;
    let spec = find(name)
        .ok_or_else(|| crate::error::Error::argument(format!("no such unit: {name}")))?;
    let (unit, opts) = spec.instantiate(rest)?;
    Ok((spec, unit, opts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_sorted_and_unique() {
        let names: Vec<_> = REGISTRY.iter().map(|s| s.name).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_commands_are_well_formed() {
        for spec in REGISTRY {
            spec.command().debug_assert();
        }
    }

    #[test]
    fn test_find() {
        assert!(find("b64").is_some());
        assert!(find("does-not-exist").is_none());
    }

    #[test]
    fn test_instantiate_rejects_unknown_unit() {
        let err = match instantiate(&["nope".to_string()]) {
            Err(e) => e,
            Ok(_) => panic!("expected instantiate error"),
        };
        assert_eq!(err.exit_code(), 2);
    }
}
