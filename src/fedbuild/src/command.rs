//! Command strings and the argument keys each of them carries.

pub const BUILDREQUEST: &str = "BUILDREQUEST";
pub const STARTCHILDPROCESS: &str = "STARTCHILDPROCESS";
pub const STOPCHILDPROCESS: &str = "STOPCHILDPROCESS";
pub const READY: &str = "READY";
pub const FILEREQUEST: &str = "FILEREQUEST";
pub const FILEREQUESTCOMPLETE: &str = "FILEREQUESTCOMPLETE";
pub const GETDIRCONTENTS: &str = "GETDIRCONTENTS";
pub const EXECTESTCASES: &str = "EXECTESTCASES";
pub const TESTFILEREQUEST: &str = "TESTFILEREQUEST";
pub const NOTIFICATION: &str = "NOTIFICATION";

pub mod arg {
    /// name of a build request file
    pub const PROJECT: &str = "PROJECT";
    /// return address of the client, `host:port`
    pub const CLIENTDETAILS: &str = "CLIENTDETAILS";
    pub const NOOFPROC: &str = "NOOFPROC";
    pub const SESSIONID: &str = "SESSIONID";
    pub const FILECOUNT: &str = "FILECOUNT";
    /// prefix of indexed file entries
    pub const FILE: &str = "FILE";
    /// requested directory, and prefix of indexed directory entries
    pub const DIRNAME: &str = "DIRNAME";
    pub const DIRCOUNT: &str = "DIRCOUNT";
    pub const CURRDIR: &str = "CURRDIR";
    pub const NOTIFMSG: &str = "NOTIFMSG";
}
