use tend_core::mesh::RoomToken;

use crate::error::CliError;

/// Print the token and the room id peers sharing it will meet in.
pub fn run_room(token: Option<&str>) -> Result<(), CliError> {
    let token = match token {
        Some(raw) => RoomToken::new(raw)?,
        None => RoomToken::generate(),
    };

    println!("token: {}", token.as_str());
    println!("room:  {}", token.room_id());
    Ok(())
}
