//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then
/// overwrites the listed fields by parsing from the given TOML string if
/// it's not `None`. Unknown field names in the string are rejected.
///
/// Example:
/// ```no_run
/// use colonnade::CoordError;
///
/// #[derive(Default)]
/// struct MyConfig {
///     write_timeout_ms: u64,
/// }
///
/// # fn example(config_str: Option<&str>) -> Result<(), CoordError> {
/// let config = colonnade::parsed_config!(config_str => MyConfig; write_timeout_ms)?;
/// # let _ = config;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, CoordError> {
            let mut config: $config_type = Default::default();
            if config_str.is_none() {
                return Ok(config);
            }

            let mut table = config_str.unwrap().parse::<toml::Table>()?;

            $({
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // leftover keys were not recognized, hence invalid
            if let Some(stray) = table.keys().next() {
                return Err(CoordError::msg(format!(
                    "invalid field name '{}' in config",
                    stray
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::CoordError;

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        abc: u16,
        hij: String,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                abc: 7,
                hij: "west".into(),
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), CoordError> {
        let config = parsed_config!(None => TestConfig; abc, hij)?;
        assert_eq!(config, Default::default());
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), CoordError> {
        let config_str = Some("hij = 'east'");
        let config = parsed_config!(config_str => TestConfig; abc, hij)?;
        assert_eq!(
            config,
            TestConfig {
                abc: 7,
                hij: "east".into(),
            }
        );
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("xyz = 999");
        assert!(parsed_config!(config_str => TestConfig; abc).is_err());
    }
}
