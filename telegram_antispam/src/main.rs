use bot_commons::start_everything;

fn main() {
    start_everything("warn,telegram_antispam=debug", telegram_antispam::entry());
}
