//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(config)` on success, and `Err(SquallError)` on parser failure.
///
/// Example:
/// ```ignore
/// let config = parsed_config!(config_str => SpoutConfig; idle_sleep_ms)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, SquallError> {
            let mut config: $config_type = Default::default();
            let Some(config_str) = config_str else {
                return Ok(config);
            };

            let mut table = config_str.parse::<toml::Table>()?;

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // any key left over at this point was not an expected field
            // name, hence invalid
            if let Some(key) = table.keys().next() {
                return Err(SquallError::msg(format!(
                    "invalid field name '{}' in config",
                    key,
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::SquallError;

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        throttle_ms: u64,
        partition: String,
        ratio: f64,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                throttle_ms: 200,
                partition: "p0".into(),
                ratio: 0.5,
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), SquallError> {
        let config =
            parsed_config!(None => TestConfig; throttle_ms, partition, ratio)?;
        let ref_config: TestConfig = Default::default();
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), SquallError> {
        let config_str = Some("partition = 'p7'");
        let config =
            parsed_config!(config_str => TestConfig; partition, ratio)?;
        let ref_config = TestConfig {
            throttle_ms: 200,
            partition: "p7".into(),
            ratio: 0.5,
        };
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("unheard_of = 999");
        assert!(
            parsed_config!(config_str => TestConfig; throttle_ms).is_err()
        );
    }
}
