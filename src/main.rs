use hdriver::{by, proto, Driver, DriverConfig, FindOptions};
use std::str::FromStr;

fn print_usage() {
    eprintln!(
        "hdriver - drive a device through its UI test harness

Usage:
  hdriver [--bundle B] [--ability A] <device-id> <command> [args...]

Commands:
  tap <x> <y>
  swipe <startx> <starty> <endx> <endy> <seconds>
  home
  back
  screen-size
  bundle                      # foreground application bundle
  find <id|text|type> <value> [--timeout S]
  start <bundle> <ability>
  stop <bundle>
  launch                      # start --bundle/--ability
  screenshot <out.png>

Environment:
  HDRIVER_HDC            Path of the hdc executable (default: hdc)
  HDRIVER_FIND_TIMEOUT   Base reply timeout in seconds (default: 10)
  HDRIVER_PORT           Use only this harness port
  RUST_LOG               Log filter (default: info)"
    );
}

fn usage_error(msg: &str) -> ! {
    eprintln!("Error: {}", msg);
    print_usage();
    std::process::exit(2);
}

fn arg<'a>(args: &'a [String], i: usize, name: &str) -> &'a str {
    args.get(i)
        .map(String::as_str)
        .unwrap_or_else(|| usage_error(&format!("missing <{}>", name)))
}

fn num<T: FromStr>(args: &[String], i: usize, name: &str) -> T {
    arg(args, i, name)
        .parse()
        .unwrap_or_else(|_| usage_error(&format!("<{}> must be a number", name)))
}

fn run(driver: &Driver, command: &str, args: &[String]) -> hdriver::Result<serde_json::Value> {
    use serde_json::json;

    let out = match command {
        "tap" => json!({ "data": driver.tap(num(args, 0, "x"), num(args, 1, "y"))? }),
        "swipe" => json!({
            "data": driver.swipe(
                num(args, 0, "startx"),
                num(args, 1, "starty"),
                num(args, 2, "endx"),
                num(args, 3, "endy"),
                num(args, 4, "seconds"),
            )?
        }),
        "home" => json!({ "data": driver.home()? }),
        "back" => json!({ "data": driver.back()? }),
        "screen-size" => json!(driver.screen_size()?),
        "bundle" => json!({ "bundle": driver.current_bundle()? }),
        "find" => {
            let criterion = match arg(args, 0, "by") {
                "id" => by::ID,
                "text" => by::TEXT,
                "type" => by::TYPE,
                other => usage_error(&format!("unknown criterion '{}'", other)),
            };
            let mut options = FindOptions {
                attributes: [
                    proto::property::ID,
                    proto::property::TEXT,
                    proto::property::TYPE,
                    proto::property::BOUNDS,
                    proto::property::BOUNDS_CENTER,
                ]
                .iter()
                .map(|p| p.to_string())
                .collect(),
                ..FindOptions::default()
            };
            if args.get(2).map(String::as_str) == Some("--timeout") {
                options.timeout_s = num(args, 3, "timeout");
            }
            let mut element = driver.find_element(criterion, arg(args, 1, "value"), &options)?;
            json!({
                "euid": element.euid(),
                "id": element.id()?.to_string(),
                "text": element.text()?.to_string(),
                "type": element.type_name()?.to_string(),
                "bounds": element.bounds()?,
                "bounds_center": element.bounds_center()?,
            })
        }
        "start" => {
            let ack = driver.start_app(arg(args, 0, "bundle"), arg(args, 1, "ability"))?;
            json!({ "data": ack })
        }
        "stop" => json!({ "data": driver.stop_app(arg(args, 0, "bundle"))? }),
        "launch" => json!({ "data": driver.launch_app()? }),
        "screenshot" => {
            let path = arg(args, 0, "out.png");
            let png = driver.screenshot_png()?;
            std::fs::write(path, &png)?;
            json!({ "path": path, "bytes": png.len() })
        }
        other => usage_error(&format!("unknown command '{}'", other)),
    };
    Ok(out)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut bundle = String::new();
    let mut ability = String::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" | "help" => {
                print_usage();
                return;
            }
            "--bundle" => {
                bundle = arg(&args, i + 1, "bundle").to_string();
                i += 2;
            }
            "--ability" => {
                ability = arg(&args, i + 1, "ability").to_string();
                i += 2;
            }
            _ => break,
        }
    }

    let device_id = arg(&args, i, "device-id");
    let command = arg(&args, i + 1, "command");
    let rest = &args[i + 2..];

    let config = DriverConfig::from_env(device_id, bundle, ability);
    let result = Driver::new(config).and_then(|driver| run(&driver, command, rest));
    match result {
        Ok(out) => println!("{}", out),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
